use super::{BenchmarkRequest, WORKER_DEVICE_VAR, WorkerError, WorkerMessage, WorkerReply, decode, encode};
use std::io::{BufRead, Write};

/// Executes benchmark requests inside a worker process.
pub trait RequestExecutor {
    /// Latency of the request in milliseconds, `+inf` when the candidate failed.
    ///
    /// An error means the request can't be executed by this worker at all.
    fn execute(&mut self, request: &BenchmarkRequest) -> Result<f64, String>;
}

/// The worker side of the pool protocol.
///
/// Announces itself, then answers one request at a time until told to shut down or until its
/// input is closed.
pub struct WorkerServer<E> {
    executor: E,
    device: Option<u32>,
}

impl<E: RequestExecutor> WorkerServer<E> {
    /// Create a server bound to the given device.
    pub fn new(executor: E, device: Option<u32>) -> Self {
        Self { executor, device }
    }

    /// Create a server bound to the device chosen by the pool.
    pub fn from_env(executor: E) -> Self {
        let device = std::env::var(WORKER_DEVICE_VAR)
            .ok()
            .and_then(|device| device.parse().ok());

        Self::new(executor, device)
    }

    /// The device the server is bound to.
    pub fn device(&self) -> Option<u32> {
        self.device
    }

    /// Serve requests read from `input`, writing replies to `output`.
    pub fn serve<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> Result<(), WorkerError> {
        send(
            &mut output,
            &WorkerReply::Ready {
                device: self.device,
                pid: std::process::id(),
            },
        )?;

        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let reply = match decode::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Shutdown) => break,
                Ok(WorkerMessage::Benchmark { request }) => self.handle(&request),
                Err(err) => WorkerReply::Rejected {
                    reason: err.to_string(),
                    device: self.device,
                },
            };

            send(&mut output, &reply)?;
        }

        Ok(())
    }

    fn handle(&mut self, request: &BenchmarkRequest) -> WorkerReply {
        if let (Some(expected), Some(device)) = (request.expected_device, self.device) {
            if expected != device {
                return WorkerReply::Rejected {
                    reason: WorkerError::DeviceMismatch {
                        expected: Some(expected),
                        actual: Some(device),
                    }
                    .to_string(),
                    device: self.device,
                };
            }
        }

        match self.executor.execute(request) {
            Ok(latency) => WorkerReply::timing(latency, self.device),
            Err(reason) => WorkerReply::Rejected {
                reason,
                device: self.device,
            },
        }
    }
}

fn send<W: Write>(output: &mut W, reply: &WorkerReply) -> Result<(), WorkerError> {
    output.write_all(encode(reply)?.as_bytes())?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tune::Configuration;
    use crate::worker::KernelRef;
    use pretty_assertions::assert_eq;

    struct Constant(f64);

    impl RequestExecutor for Constant {
        fn execute(&mut self, _request: &BenchmarkRequest) -> Result<f64, String> {
            Ok(self.0)
        }
    }

    fn request(expected_device: Option<u32>) -> String {
        let request = BenchmarkRequest {
            kernel: KernelRef {
                name: "probe".into(),
                source_hash: "probe".into(),
            },
            args: Vec::new(),
            config: Configuration::new(1, 1),
            expected_device,
        };
        encode(&WorkerMessage::Benchmark { request }).unwrap()
    }

    fn replies(output: Vec<u8>) -> Vec<WorkerReply> {
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| decode(line).unwrap())
            .collect()
    }

    #[test_log::test]
    fn announces_then_answers() {
        let input = format!("{}{}", request(Some(1)), encode(&WorkerMessage::Shutdown).unwrap());
        let mut output = Vec::new();

        WorkerServer::new(Constant(2.5), Some(1))
            .serve(input.as_bytes(), &mut output)
            .unwrap();
        let replies = replies(output);

        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], WorkerReply::Ready { device: Some(1), .. }));
        assert_eq!(replies[1], WorkerReply::timing(2.5, Some(1)));
    }

    #[test_log::test]
    fn rejects_requests_for_another_device() {
        let input = request(Some(0));
        let mut output = Vec::new();

        WorkerServer::new(Constant(2.5), Some(1))
            .serve(input.as_bytes(), &mut output)
            .unwrap();

        assert!(matches!(
            replies(output)[1],
            WorkerReply::Rejected { device: Some(1), .. }
        ));
    }

    #[test_log::test]
    fn unbound_worker_accepts_every_device() {
        let input = request(Some(3));
        let mut output = Vec::new();

        WorkerServer::new(Constant(1.0), None)
            .serve(input.as_bytes(), &mut output)
            .unwrap();

        assert_eq!(replies(output)[1], WorkerReply::timing(1.0, None));
    }
}
