//! Local problem data layout
//!
//! Test data distribution is handled outside the worker; this module only
//! reads the already-synced on-disk layout:
//!
//! ```text
//! <base>/<problem>/checker.cpp
//! <base>/<problem>/in/<case>.in
//! <base>/<problem>/out/<case>.out
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Input/expected file pair for one test case.
#[derive(Debug, Clone)]
pub struct CaseFiles {
    pub name: String,
    pub input: PathBuf,
    pub expected: PathBuf,
}

/// Everything needed to judge one problem: its checker source and its test
/// cases in name order.
#[derive(Debug, Clone)]
pub struct ProblemFiles {
    pub checker: PathBuf,
    pub cases: Vec<CaseFiles>,
}

pub fn load_problem(base: &Path, problem: &str) -> Result<ProblemFiles> {
    let dir = base.join(problem);
    let checker = dir.join("checker.cpp");
    if !checker.is_file() {
        anyhow::bail!("problem {} has no checker at {}", problem, checker.display());
    }

    let in_dir = dir.join("in");
    let out_dir = dir.join("out");
    let mut cases = Vec::new();
    let entries = std::fs::read_dir(&in_dir)
        .with_context(|| format!("failed to list {}", in_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("in") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("unusable case file name {}", path.display()))?;
        let expected = out_dir.join(format!("{name}.out"));
        if !expected.is_file() {
            anyhow::bail!(
                "case {} of problem {} has no expected output at {}",
                name,
                problem,
                expected.display()
            );
        }
        cases.push(CaseFiles {
            name,
            input: path,
            expected,
        });
    }

    cases.sort_by(|a, b| a.name.cmp(&b.name));

    if cases.is_empty() {
        anyhow::bail!("problem {} has no test cases", problem);
    }

    Ok(ProblemFiles { checker, cases })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_problem_sorted() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("aplusb");
        write(&dir.join("checker.cpp"), "// checker");
        write(&dir.join("in/example_01.in"), "1 2\n");
        write(&dir.join("out/example_01.out"), "3\n");
        write(&dir.join("in/example_00.in"), "0 0\n");
        write(&dir.join("out/example_00.out"), "0\n");

        let problem = load_problem(base.path(), "aplusb").unwrap();
        let names: Vec<_> = problem.cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["example_00", "example_01"]);
    }

    #[test]
    fn test_missing_expected_output_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("aplusb");
        write(&dir.join("checker.cpp"), "// checker");
        write(&dir.join("in/example_00.in"), "0 0\n");

        assert!(load_problem(base.path(), "aplusb").is_err());
    }

    #[test]
    fn test_missing_checker_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("aplusb/in")).unwrap();
        assert!(load_problem(base.path(), "aplusb").is_err());
    }
}
