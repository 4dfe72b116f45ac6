//! Target directory layout and validation
//!
//! A target directory holds the inputs for one search:
//!
//! ```text
//! <dir>/
//!   base.c         starting source
//!   target.o       object file to match
//!   compile.sh     executable: compile.sh <input.c> -o <output.o>
//!   function.txt   optional: name of the function being matched
//! ```

use crate::error::ValidationError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Paths of a validated target directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    pub dir: PathBuf,
    pub base_c: PathBuf,
    pub target_o: PathBuf,
    pub compile_sh: PathBuf,
    pub fn_name: Option<String>,
}

impl TargetLayout {
    /// Check that `dir` has every required file and that the compile script
    /// is executable
    pub fn validate(dir: &Path) -> Result<Self, ValidationError> {
        let base_c = dir.join("base.c");
        let target_o = dir.join("target.o");
        let compile_sh = dir.join("compile.sh");

        for path in [&base_c, &target_o, &compile_sh] {
            if !path.is_file() {
                return Err(ValidationError::MissingFile(path.clone()));
            }
        }
        if !is_executable(&compile_sh) {
            return Err(ValidationError::NotExecutable(compile_sh));
        }

        let fn_name = fs::read_to_string(dir.join("function.txt"))
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(Self {
            dir: dir.to_path_buf(),
            base_c,
            target_o,
            compile_sh,
            fn_name,
        })
    }

    /// Function name if known, otherwise the directory name
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.fn_name {
            return name.clone();
        }
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }
}

impl fmt::Display for TargetLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fn_name {
            Some(name) => write!(f, "{} ({})", self.base_c.display(), name),
            None => write!(f, "{}", self.base_c.display()),
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::mock::create_target_fixture;

    #[test]
    fn test_valid_fixture() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_target_fixture(tmp.path(), "func").unwrap();

        let layout = TargetLayout::validate(&dir).unwrap();
        assert_eq!(layout.fn_name.as_deref(), Some("func"));
        assert_eq!(layout.display_name(), "func");
        assert_eq!(layout.to_string(), format!("{} (func)", dir.join("base.c").display()));
    }

    #[test]
    fn test_missing_target_object() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_target_fixture(tmp.path(), "func").unwrap();
        fs::remove_file(dir.join("target.o")).unwrap();

        match TargetLayout::validate(&dir) {
            Err(ValidationError::MissingFile(path)) => assert_eq!(path, dir.join("target.o")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_compile_script_must_be_executable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_target_fixture(tmp.path(), "func").unwrap();
        fs::set_permissions(dir.join("compile.sh"), fs::Permissions::from_mode(0o644)).unwrap();

        let err = TargetLayout::validate(&dir).unwrap_err();
        assert!(matches!(err, ValidationError::NotExecutable(_)));
        assert!(err.to_string().ends_with("must be marked executable."));
    }

    #[test]
    fn test_name_falls_back_to_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_target_fixture(tmp.path(), "nameless").unwrap();
        fs::remove_file(dir.join("function.txt")).unwrap();

        let layout = TargetLayout::validate(&dir).unwrap();
        assert_eq!(layout.fn_name, None);
        assert_eq!(layout.display_name(), "nameless");
    }
}
