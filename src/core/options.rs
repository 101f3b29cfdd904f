//! Backend configuration.
//!
//! Options are fixed when the backend is constructed. The linking style in
//! particular is never switched at runtime: each style keeps its own guard
//! placement and both are exercised by separate tests.

use super::error::{JitError, JitResult};

/// Default size of the code cache. Offsets are stored as `u32`.
pub const DEFAULT_CODE_SPACE_SIZE: usize = 16 * 1024 * 1024;
/// Largest code cache: blocks reach the fixed code with rel32 branches.
pub const MAX_CODE_SPACE_SIZE: usize = i32::MAX as usize;

/// Where a block's downcount guard lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStyle {
    /// Guard in front of the block; the checked entry precedes the body.
    #[default]
    ForwardCheck,
    /// Guard after the body, jumping back to the block start.
    BackJump,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitOptions {
    pub enable_blocklink: bool,
    pub link_style: LinkStyle,
    /// Keep the guest downcount in a host register across blocks.
    pub use_static_alloc: bool,
    pub disable_regalloc_gpr: bool,
    pub disable_regalloc_fpr: bool,
    /// Emit the missing-exit guard and interpret notifications.
    pub diagnostic_checks: bool,
    /// Never map code writable and executable at the same time.
    pub wx_exclusive: bool,
    pub code_space_size: usize,
    /// Dump host code for this many upcoming blocks.
    pub log_blocks: u32,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            enable_blocklink: true,
            link_style: LinkStyle::ForwardCheck,
            use_static_alloc: false,
            disable_regalloc_gpr: false,
            disable_regalloc_fpr: false,
            diagnostic_checks: cfg!(debug_assertions),
            wx_exclusive: true,
            code_space_size: DEFAULT_CODE_SPACE_SIZE,
            log_blocks: 0,
        }
    }
}

impl JitOptions {
    /// Defaults overlaid with `IRJIT_*` environment variables.
    pub fn from_env() -> JitResult<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn overlay<F>(mut self, lookup: F) -> JitResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IRJIT_BLOCKLINK") {
            self.enable_blocklink = parse_bool("IRJIT_BLOCKLINK", &v)?;
        }
        if let Some(v) = lookup("IRJIT_BACKJUMP") {
            self.link_style = if parse_bool("IRJIT_BACKJUMP", &v)? {
                LinkStyle::BackJump
            } else {
                LinkStyle::ForwardCheck
            };
        }
        if let Some(v) = lookup("IRJIT_STATIC_ALLOC") {
            self.use_static_alloc = parse_bool("IRJIT_STATIC_ALLOC", &v)?;
        }
        if let Some(v) = lookup("IRJIT_NO_REGALLOC_GPR") {
            self.disable_regalloc_gpr = parse_bool("IRJIT_NO_REGALLOC_GPR", &v)?;
        }
        if let Some(v) = lookup("IRJIT_NO_REGALLOC_FPR") {
            self.disable_regalloc_fpr = parse_bool("IRJIT_NO_REGALLOC_FPR", &v)?;
        }
        if let Some(v) = lookup("IRJIT_DIAGNOSTICS") {
            self.diagnostic_checks = parse_bool("IRJIT_DIAGNOSTICS", &v)?;
        }
        if let Some(v) = lookup("IRJIT_WX_EXCLUSIVE") {
            self.wx_exclusive = parse_bool("IRJIT_WX_EXCLUSIVE", &v)?;
        }
        if let Some(v) = lookup("IRJIT_CODE_SPACE") {
            let size = parse_number("IRJIT_CODE_SPACE", &v)?;
            if size == 0 || size > MAX_CODE_SPACE_SIZE as u64 {
                return Err(invalid("IRJIT_CODE_SPACE", &v));
            }
            self.code_space_size = size as usize;
        }
        if let Some(v) = lookup("IRJIT_LOG_BLOCKS") {
            let count = parse_number("IRJIT_LOG_BLOCKS", &v)?;
            self.log_blocks = u32::try_from(count).map_err(|_| invalid("IRJIT_LOG_BLOCKS", &v))?;
        }
        Ok(self)
    }

    /// Reject combinations the backend cannot honour.
    pub fn validate(&self) -> JitResult<()> {
        if self.code_space_size == 0 || self.code_space_size > MAX_CODE_SPACE_SIZE {
            return Err(invalid("code_space_size", &self.code_space_size.to_string()));
        }
        Ok(())
    }

    pub fn uses_back_jump(&self) -> bool {
        self.enable_blocklink && self.link_style == LinkStyle::BackJump
    }

    pub fn uses_forward_check(&self) -> bool {
        self.enable_blocklink && self.link_style == LinkStyle::ForwardCheck
    }
}

fn invalid(key: &str, value: &str) -> JitError {
    JitError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> JitResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_number(key: &str, value: &str) -> JitResult<u64> {
    let trimmed = value.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|_| invalid(key, value))
}
