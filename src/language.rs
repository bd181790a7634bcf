//! Language interface boundary
//!
//! The full language registry (bash/dart/elixir/julia/kotlin/R/scala/sqlite/
//! swift/typescript wrappers, each just supplying a file extension and two
//! command templates) is out of scope — it's the HTTP layer's collaborator,
//! not this crate's. What this crate needs is the seam those wrappers would
//! implement, so a compile-then-run driver has something concrete to call.
//! Grounded on the teacher's `LanguageConfig` (`languages.rs`): same three
//! pieces of information, reduced from a TOML-driven registry to a trait.

/// What a per-language wrapper supplies: where the source goes, how (or
/// whether) to compile it, and how to run it.
pub trait LanguageSpec: Send + Sync {
    /// File name the source should be written as inside the box (e.g. `main.c`).
    fn source_file_name(&self) -> &str;

    /// Argv to compile the source, or `None` for interpreted languages.
    fn compile_command(&self) -> Option<&[String]>;

    /// Argv to execute the (possibly just-compiled) program.
    fn execute_command(&self) -> &[String];
}

/// One illustrative implementation, standing in for the nine-plus real
/// per-language wrappers this crate does not own.
pub struct CLanguage {
    compile: Vec<String>,
    execute: Vec<String>,
}

impl Default for CLanguage {
    fn default() -> Self {
        Self {
            compile: vec![
                "/usr/bin/gcc".to_string(),
                "-O2".to_string(),
                "-o".to_string(),
                "main".to_string(),
                "main.c".to_string(),
            ],
            execute: vec!["./main".to_string()],
        }
    }
}

impl LanguageSpec for CLanguage {
    fn source_file_name(&self) -> &str {
        "main.c"
    }

    fn compile_command(&self) -> Option<&[String]> {
        Some(&self.compile)
    }

    fn execute_command(&self) -> &[String] {
        &self.execute
    }
}
