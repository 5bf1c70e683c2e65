//! JSON 파일 저장소
//!
//! 설정 파일과 rule export에 쓰인다. 저장은 임시 파일 작성 후 rename 하므로
//! 읽는 쪽은 항상 완성된 파일만 본다.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Directory of JSON documents addressed by file name
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `<config dir>/dbguard`
    pub fn global() -> Result<Self> {
        dirs::config_dir()
            .map(|dir| Self::new(dir.join("dbguard")))
            .ok_or_else(|| Error::Config("No user config directory on this platform".to_string()))
    }

    /// `<root>/.dbguard`
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(".dbguard"))
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.file_path(name);
        let raw = std::fs::read(&path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("{}: invalid JSON: {}", path.display(), e)))
    }

    /// `None` when the file does not exist
    pub fn load_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        if self.file_path(name).is_file() {
            self.load(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let body = serde_json::to_vec_pretty(value)?;

        let target = self.file_path(name);
        let staging = self.file_path(&format!(".{}.tmp", name));
        std::fs::write(&staging, body)?;
        std::fs::rename(&staging, &target).map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            Error::Storage(format!("Failed to replace {}: {}", target.display(), e))
        })
    }
}
