use ktune_runtime::DeviceId;
use ktune_runtime::tune::{
    Candidate, CompileError, Configuration, KernelCompiler, KernelSpec, Launcher, ResourceUsage,
};
use std::sync::{Arc, Mutex};

use super::BLOCK;

/// Compiles candidates that return their own configuration, recording every compilation.
#[derive(Clone, Default)]
pub struct CountingCompiler {
    compiled: Arc<Mutex<Vec<Configuration>>>,
    max_block: Option<u32>,
    spills: Vec<(u32, u32)>,
}

impl CountingCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks above `max` are infeasible.
    pub fn with_max_block(mut self, max: u32) -> Self {
        self.max_block = Some(max);
        self
    }

    /// Candidates with the given block spill `spills` registers.
    pub fn with_spills(mut self, block: u32, spills: u32) -> Self {
        self.spills.push((block, spills));
        self
    }

    pub fn compile_count(&self, config: &Configuration) -> usize {
        self.compiled
            .lock()
            .unwrap()
            .iter()
            .filter(|compiled| *compiled == config)
            .count()
    }

    pub fn total_compiles(&self) -> usize {
        self.compiled.lock().unwrap().len()
    }
}

impl KernelCompiler<(), Configuration> for CountingCompiler {
    fn compile(
        &self,
        _kernel: &KernelSpec,
        config: &Configuration,
    ) -> Result<Candidate<(), Configuration>, CompileError> {
        self.compiled.lock().unwrap().push(config.clone());

        let block = config.get(BLOCK).unwrap_or_default();
        if self.max_block.is_some_and(|max| block > max) {
            return Err(CompileError::Infeasible {
                reason: format!("Block {block} is too large"),
            });
        }

        let spills = self
            .spills
            .iter()
            .find(|(size, _)| *size == block)
            .map(|(_, spills)| *spills)
            .unwrap_or_default();

        let output = config.clone();
        Ok(Candidate::new(
            config.clone(),
            DeviceId::host(),
            ResourceUsage::new(32, spills, 0),
            Launcher::new(move |_: &()| Ok(output.clone())),
        ))
    }
}
