// Test file fixtures

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

/// Manages temporary test files
pub struct TestFixture {
    _temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestFixture {
    /// Create a new temporary file with given content
    pub fn new(filename: &str, content: &str) -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join(filename);

        let mut file = fs::File::create(&path)?;
        file.write_all(content.as_bytes())?;
        file.flush()?;

        Ok(TestFixture {
            _temp_dir: temp_dir,
            path,
        })
    }

    /// Read the current content of the file
    pub fn read_content(&self) -> anyhow::Result<String> {
        Ok(fs::read_to_string(&self.path)?)
    }
}

/// `count` lines of the form `line NNN`, each followed by a newline
pub fn numbered_lines(count: usize) -> String {
    (0..count).map(|i| format!("line {i:03}\n")).collect()
}
