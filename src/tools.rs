use crate::error::{PipelineError, Result};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

/// The four external collaborators. Everything they compute is consumed
/// through file contracts; the core only prepares inputs and forwards
/// arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// Sequence translation.
    SeqKit,
    /// All-vs-all protein similarity search.
    Diamond,
    /// Multiple sequence alignment.
    Mafft,
    /// Substitution model selection and ML tree inference.
    IqTree,
}

impl Tool {
    pub const ALL: [Tool; 4] = [Tool::SeqKit, Tool::Diamond, Tool::Mafft, Tool::IqTree];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::SeqKit => "seqkit",
            Tool::Diamond => "diamond",
            Tool::Mafft => "mafft",
            Tool::IqTree => "iqtree",
        }
    }

    /// Expected executable file name.
    pub fn executable(&self) -> &'static str {
        match self {
            Tool::SeqKit => "seqkit",
            Tool::Diamond => "diamond",
            Tool::Mafft => "mafft",
            Tool::IqTree => "iqtree2",
        }
    }

    /// Environment variable naming a directory that overrides PATH lookup.
    pub fn env_var(&self) -> &'static str {
        match self {
            Tool::SeqKit => "SEQKIT_PATH",
            Tool::Diamond => "DIAMOND_PATH",
            Tool::Mafft => "MAFFT_PATH",
            Tool::IqTree => "IQTREE_PATH",
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Resolved executable paths, built once at startup before any stage runs.
#[derive(Debug, Clone)]
pub struct Toolset {
    paths: HashMap<Tool, PathBuf>,
}

impl Toolset {
    /// Resolve all four tools: the `<TOOL>_PATH` directory first, then a
    /// PATH search by executable name. Fails naming the first missing tool.
    pub fn resolve() -> Result<Self> {
        let search: Vec<PathBuf> = env::var_os("PATH")
            .map(|p| env::split_paths(&p).collect())
            .unwrap_or_default();

        let mut paths = HashMap::new();
        for tool in Tool::ALL {
            let env_dir = env::var_os(tool.env_var()).map(PathBuf::from);
            let resolved = locate(tool, env_dir.as_deref(), &search).ok_or_else(|| {
                PipelineError::ExecutableNotFound {
                    tool: tool.name().to_string(),
                    executable: tool.executable().to_string(),
                    env_var: tool.env_var().to_string(),
                }
            })?;
            info!("resolved {}: {}", tool, resolved.display());
            paths.insert(tool, resolved);
        }
        Ok(Self { paths })
    }

    /// Build a toolset from known paths. Used by embedders and tests; no
    /// lookup is performed.
    pub fn from_paths(paths: HashMap<Tool, PathBuf>) -> Self {
        Self { paths }
    }

    pub fn path(&self, tool: Tool) -> &Path {
        &self.paths[&tool]
    }
}

/// Resolution order: explicit env directory joined with the executable name,
/// then each PATH entry.
fn locate(tool: Tool, env_dir: Option<&Path>, search: &[PathBuf]) -> Option<PathBuf> {
    if let Some(dir) = env_dir {
        let candidate = dir.join(tool.executable());
        if candidate.is_file() {
            return Some(candidate);
        }
        return None;
    }
    search
        .iter()
        .map(|dir| dir.join(tool.executable()))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        path
    }

    #[test]
    fn test_env_dir_takes_precedence() {
        let env_dir = tempfile::tempdir().unwrap();
        let path_dir = tempfile::tempdir().unwrap();
        let from_env = fake_executable(env_dir.path(), "mafft");
        fake_executable(path_dir.path(), "mafft");

        let found = locate(
            Tool::Mafft,
            Some(env_dir.path()),
            &[path_dir.path().to_path_buf()],
        );
        assert_eq!(found, Some(from_env));
    }

    #[test]
    fn test_env_dir_without_executable_does_not_fall_back() {
        let env_dir = tempfile::tempdir().unwrap();
        let path_dir = tempfile::tempdir().unwrap();
        fake_executable(path_dir.path(), "diamond");

        let found = locate(
            Tool::Diamond,
            Some(env_dir.path()),
            &[path_dir.path().to_path_buf()],
        );
        assert_eq!(found, None);
    }

    #[test]
    fn test_path_search_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = fake_executable(first.path(), "iqtree2");
        fake_executable(second.path(), "iqtree2");

        let found = locate(
            Tool::IqTree,
            None,
            &[first.path().to_path_buf(), second.path().to_path_buf()],
        );
        assert_eq!(found, Some(expected));
    }

    #[test]
    fn test_missing_everywhere() {
        let empty = tempfile::tempdir().unwrap();
        let found = locate(Tool::SeqKit, None, &[empty.path().to_path_buf()]);
        assert_eq!(found, None);
    }

    #[test]
    fn test_from_paths_lookup() {
        let mut paths = HashMap::new();
        paths.insert(Tool::Mafft, PathBuf::from("/opt/mafft/mafft"));
        let toolset = Toolset::from_paths(paths);
        assert_eq!(toolset.path(Tool::Mafft), Path::new("/opt/mafft/mafft"));
    }
}
