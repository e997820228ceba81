//! Test utilities for arena-based testing.

#[cfg(test)]
pub mod test {
    use super::super::session::CompilationSession;
    use super::super::symbols::SymbolTable;
    use crate::tree::TreeBuilder;
    use bumpalo::Bump;

    /// Owns the arena that trees built in a test live in.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        pub fn arena(&self) -> &Bump {
            &self.arena
        }

        pub fn builder<'s>(&self, symbols: &'s mut SymbolTable) -> TreeBuilder<'_, 's> {
            TreeBuilder::new(&self.arena, symbols)
        }

        /// The returned session borrows from the context, so the context
        /// must outlive it.
        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }

        pub fn with_session<F, R>(&self, f: F) -> R
        where
            F: FnOnce(&CompilationSession<'_>) -> R,
        {
            let session = self.create_session();
            f(&session)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }
}
