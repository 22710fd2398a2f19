//! Runtime configuration
//!
//! Read once when the runtime is created. Every field has an environment
//! variable so deployed binaries can be reconfigured without a rebuild.

use std::env;
use std::path::PathBuf;

/// Directory for the compilation cache; overrides `<exe dir>/cache`.
pub const ENV_CACHE_DIR: &str = "ANYDSL_CACHE_DIR";
/// Register CUDA as a placeholder platform even when the feature is built.
pub const ENV_DISABLE_CUDA: &str = "ANYDSL_DISABLE_CUDA";
/// External compiler used by the JIT.
pub const ENV_JIT_COMPILER: &str = "ANYDSL_JIT_COMPILER";
/// Extra whitespace-separated arguments passed to the JIT compiler.
pub const ENV_JIT_ARGS: &str = "ANYDSL_JIT_ARGS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub cache_dir: Option<PathBuf>,
    pub enable_cuda: bool,
    /// Without a compiler the JIT reports `NotSupported`.
    pub jit_compiler: Option<PathBuf>,
    pub jit_compiler_args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            enable_cuda: true,
            jit_compiler: None,
            jit_compiler_args: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name| lookup(name).filter(|value: &String| !value.trim().is_empty());

        Self {
            cache_dir: non_empty(ENV_CACHE_DIR).map(PathBuf::from),
            enable_cuda: !non_empty(ENV_DISABLE_CUDA).is_some_and(|value| parse_flag(&value)),
            jit_compiler: non_empty(ENV_JIT_COMPILER).map(PathBuf::from),
            jit_compiler_args: non_empty(ENV_JIT_ARGS)
                .map(|value| value.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_jit_compiler(mut self, compiler: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.jit_compiler = Some(compiler.into());
        self.jit_compiler_args = args;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
