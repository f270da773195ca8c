/// Incremental content hasher producing stable, lowercase hex digests.
///
/// Digests only depend on the bytes fed to the hasher, so they can be persisted and compared
/// across processes and machines.
pub struct ContentHasher {
    context: md5::Context,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    /// Create a new content hasher.
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
        }
    }

    /// Feed raw bytes.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.context.consume(bytes);
        self
    }

    /// Feed a string followed by a line separator.
    ///
    /// The separator keeps `("ab", "c")` and `("a", "bc")` from colliding.
    pub fn line(&mut self, value: &str) -> &mut Self {
        self.update(value.as_bytes());
        self.update(b"\n")
    }

    /// Finalize and return the hex digest.
    pub fn finalize(self) -> String {
        format!("{:x}", self.context.compute())
    }

    /// Hash a single string.
    pub fn hash_str(value: &str) -> String {
        let mut hasher = Self::new();
        hasher.update(value.as_bytes());
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn digest_is_stable() {
        assert_eq!(
            ContentHasher::hash_str(""),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test_log::test]
    fn lines_are_separated() {
        let mut a = ContentHasher::new();
        a.line("ab").line("c");
        let mut b = ContentHasher::new();
        b.line("a").line("bc");

        assert_ne!(a.finalize(), b.finalize());
    }
}
