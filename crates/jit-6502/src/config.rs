//! Runtime options.
//!
//! Options arrive as a comma-separated `key=value` string, the same shape
//! the emulator frontend passes through from its command line.

use thiserror::Error;

/// Default instruction budget for an unoptimised block.
const MAX_OPS_UNOPTIMIZED: u32 = 4;

/// Default instruction budget for an optimised block.
const MAX_OPS_OPTIMIZED: u32 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("bad value '{value}' for option '{key}'")]
    BadValue { key: String, value: String },
}

/// Translator behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Run the optimiser over decoded blocks.
    pub optimizing: bool,
    /// Allow promotion of self-modified operands to run-time fetches.
    pub dynamic_operand: bool,
    /// Allow promotion of self-modified opcodes to run-time dispatch.
    pub dynamic_opcode: bool,
    /// Recompile precisely on entry into the middle of an instruction or a
    /// merged uop; when off, such entries re-execute the covering uop.
    pub sub_instruction: bool,
    /// Instruction budget per block; 0 selects the default for the current
    /// optimizing mode.
    pub max_ops: u32,
    /// Invalidation count above which an address is promoted to a dynamic
    /// form on its next compile.
    pub dynamic_trigger: u32,
    /// Charge page-crossing and taken-branch penalties at run time.
    pub accurate_cycles: bool,
    /// Invoke the debug callback at every instruction boundary.
    pub debug: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            optimizing: true,
            dynamic_operand: true,
            dynamic_opcode: true,
            sub_instruction: false,
            max_ops: 0,
            dynamic_trigger: 1,
            accurate_cycles: true,
            debug: false,
        }
    }
}

impl JitConfig {
    /// Parse a `key=value,key=value` option string over the defaults.
    pub fn from_flags(flags: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for item in flags.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                // A bare key is shorthand for key=1.
                None => (item, "1"),
            };
            match key {
                "optimizing" => config.optimizing = parse_bool(key, value)?,
                "dynamic_operand" => config.dynamic_operand = parse_bool(key, value)?,
                "dynamic_opcode" => config.dynamic_opcode = parse_bool(key, value)?,
                "sub_instruction" => config.sub_instruction = parse_bool(key, value)?,
                "accurate_cycles" => config.accurate_cycles = parse_bool(key, value)?,
                "debug" => config.debug = parse_bool(key, value)?,
                "max_ops" => config.max_ops = parse_u32(key, value)?,
                "dynamic_trigger" => config.dynamic_trigger = parse_u32(key, value)?,
                _ => return Err(ConfigError::UnknownOption(key.to_string())),
            }
        }
        Ok(config)
    }

    /// The instruction budget in effect for one block compile.
    #[must_use]
    pub fn effective_max_ops(&self) -> u32 {
        if self.max_ops != 0 {
            self.max_ops
        } else if self.optimizing {
            MAX_OPS_OPTIMIZED
        } else {
            MAX_OPS_UNOPTIMIZED
        }
    }

    /// Invalidation count above which an opcode byte write promotes the
    /// instruction to run-time opcode dispatch.
    #[must_use]
    pub fn opcode_trigger(&self) -> u32 {
        self.dynamic_trigger.saturating_mul(4)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::BadValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = JitConfig::default();
        assert!(config.optimizing);
        assert!(config.accurate_cycles);
        assert!(!config.sub_instruction);
        assert_eq!(config.dynamic_trigger, 1);
        assert_eq!(config.effective_max_ops(), MAX_OPS_OPTIMIZED);
    }

    #[test]
    fn parse_flags() {
        let config =
            JitConfig::from_flags("optimizing=0,max_ops=16,sub_instruction").unwrap();
        assert!(!config.optimizing);
        assert!(config.sub_instruction);
        assert_eq!(config.max_ops, 16);
        assert_eq!(config.effective_max_ops(), 16);
    }

    #[test]
    fn unoptimized_budget() {
        let config = JitConfig::from_flags("optimizing=false").unwrap();
        assert_eq!(config.effective_max_ops(), MAX_OPS_UNOPTIMIZED);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert_eq!(
            JitConfig::from_flags("turbo=1"),
            Err(ConfigError::UnknownOption("turbo".to_string()))
        );
        assert!(matches!(
            JitConfig::from_flags("max_ops=lots"),
            Err(ConfigError::BadValue { .. })
        ));
    }
}
