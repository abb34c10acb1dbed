//! Compiler configuration
//!
//! A [`CompilerConfig`] value is threaded through every pass; there are no
//! global registries. Defaults may come from a project-level `bolt.toml`,
//! with CLI flags layered on top by the driver.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Target ABI, fixed per translation unit. Selects the object container,
/// the calling convention, the mangling scheme and the debug-info format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetAbi {
    /// System V AMD64, Itanium mangling, ELF64 + DWARF4.
    #[default]
    LinuxElf,
    /// Microsoft x64, MSVC mangling, COFF + CodeView.
    WindowsCoff,
}

impl TargetAbi {
    pub fn parse(s: &str) -> Option<TargetAbi> {
        match s {
            "linux-elf" | "linux" | "elf" => Some(TargetAbi::LinuxElf),
            "windows-coff" | "windows" | "coff" => Some(TargetAbi::WindowsCoff),
            _ => None,
        }
    }

    /// Width of `size_t` is 8 on both targets; the spelling differs and
    /// affects mangling ('m' vs '_K') and `__SIZE_TYPE__`.
    pub fn size_t_is_unsigned_long(self) -> bool {
        matches!(self, TargetAbi::LinuxElf)
    }
}

/// Pipeline-wide settings.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub target: TargetAbi,
    /// `#include <...>` search paths, in order.
    pub include_paths: Vec<PathBuf>,
    /// Driver-supplied macro definitions (`-D NAME[=VALUE]`).
    pub defines: Vec<(String, Option<String>)>,
    /// Constexpr evaluation step budget.
    pub constexpr_step_limit: u64,
    /// Template instantiation recursion limit.
    pub template_depth_limit: usize,
    /// Emit `.debug_*` / `.debug$S` sections.
    pub debug_info: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            target: TargetAbi::default(),
            include_paths: Vec::new(),
            defines: Vec::new(),
            constexpr_step_limit: 1_000_000,
            template_depth_limit: 1024,
            debug_info: false,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: TargetAbi) -> Self {
        self.target = target;
        self
    }

    pub fn with_include_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_paths.push(path.into());
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.defines.push((name.into(), value));
        self
    }

    /// Load defaults from a `bolt.toml` next to the source (or given
    /// explicitly). Missing file is not an error; a malformed one is.
    pub fn load_project_file(path: &Path) -> Result<Option<ProjectFile>, String> {
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let parsed: ProjectFile =
            toml::from_str(&text).map_err(|e| format!("malformed {}: {}", path.display(), e))?;
        Ok(Some(parsed))
    }

    /// Apply project-file defaults under any already-set values.
    pub fn apply_project_file(&mut self, file: &ProjectFile) {
        if let Some(target) = &file.target
            && let Some(t) = TargetAbi::parse(target)
        {
            self.target = t;
        }
        for p in &file.include_paths {
            self.include_paths.push(PathBuf::from(p));
        }
        for d in &file.defines {
            match d.split_once('=') {
                Some((name, value)) => self
                    .defines
                    .push((name.to_string(), Some(value.to_string()))),
                None => self.defines.push((d.clone(), None)),
            }
        }
        if let Some(limit) = file.constexpr_step_limit {
            self.constexpr_step_limit = limit;
        }
        if let Some(limit) = file.template_depth_limit {
            self.template_depth_limit = limit;
        }
        if let Some(debug) = file.debug_info {
            self.debug_info = debug;
        }
    }
}

/// On-disk shape of `bolt.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectFile {
    pub target: Option<String>,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub defines: Vec<String>,
    pub constexpr_step_limit: Option<u64>,
    pub template_depth_limit: Option<usize>,
    pub debug_info: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(TargetAbi::parse("linux-elf"), Some(TargetAbi::LinuxElf));
        assert_eq!(TargetAbi::parse("windows"), Some(TargetAbi::WindowsCoff));
        assert_eq!(TargetAbi::parse("arm"), None);
    }

    #[test]
    fn test_builder_chain() {
        let config = CompilerConfig::new()
            .with_target(TargetAbi::WindowsCoff)
            .with_include_path("/usr/include")
            .with_define("NDEBUG", None);
        assert_eq!(config.target, TargetAbi::WindowsCoff);
        assert_eq!(config.include_paths.len(), 1);
        assert_eq!(config.defines[0].0, "NDEBUG");
    }

    #[test]
    fn test_project_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bolt.toml");
        std::fs::write(
            &path,
            "target = \"windows-coff\"\ninclude_paths = [\"inc\"]\ndefines = [\"X=1\", \"Y\"]\ndebug_info = true\n",
        )
        .unwrap();
        let file = CompilerConfig::load_project_file(&path).unwrap().unwrap();
        let mut config = CompilerConfig::default();
        config.apply_project_file(&file);
        assert_eq!(config.target, TargetAbi::WindowsCoff);
        assert_eq!(config.include_paths, vec![PathBuf::from("inc")]);
        assert_eq!(
            config.defines,
            vec![
                ("X".to_string(), Some("1".to_string())),
                ("Y".to_string(), None)
            ]
        );
        assert!(config.debug_info);
    }

    #[test]
    fn test_missing_project_file_is_none() {
        let got = CompilerConfig::load_project_file(Path::new("/nonexistent/bolt.toml")).unwrap();
        assert!(got.is_none());
    }
}
