//! Exposed constructors API for the [`Interpreter`]

use super::Interpreter;

impl<'m> Interpreter<'m> {
    /// Create a container with empty stacks and no module attached.
    pub fn new() -> Self {
        Self::default()
    }
}
