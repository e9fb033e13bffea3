//! クラスインデックスマッピング
//!
//! クラス名 ⇔ クラスインデックスの対応表です。学習開始時に一度だけ作成し、
//! チェックポイントと一緒に `{"cats": 0, "not_cats": 1}` 形式のJSONで保存します。
//! 推論側はインデックスを自分で導出せず、必ずこのファイルを読み込みます。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ClassifierError, Result};
use crate::model::model_storage::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, usize>", into = "BTreeMap<String, usize>")]
pub struct ClassIndexMapping {
    /// インデックス順のクラス名
    names: Vec<String>,
}

impl ClassIndexMapping {
    /// クラス名の並びから作成する（並び順がそのままインデックスになる）
    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Result<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut seen = std::collections::HashSet::new();
        for name in &names {
            if name.is_empty() || !seen.insert(name.as_str()) {
                return Err(ClassifierError::Configuration(format!(
                    "class names must be non-empty and unique: {:?}",
                    names
                )));
            }
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// インデックス順のクラス名
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 一時ファイル経由で保存する
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_json_string()?.as_bytes())
    }

    /// ファイルから読み込む。ファイルが無い場合は `ModelNotLoaded`
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::ModelNotLoaded(format!(
                "class index mapping {} is not readable: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_string(&json)
    }
}

impl TryFrom<BTreeMap<String, usize>> for ClassIndexMapping {
    type Error = String;

    fn try_from(map: BTreeMap<String, usize>) -> std::result::Result<Self, Self::Error> {
        let mut names = vec![None; map.len()];
        for (name, index) in map {
            let slot = names
                .get_mut(index)
                .ok_or_else(|| format!("class index {} of '{}' is out of range", index, name))?;
            if let Some(other) = slot.as_ref() {
                return Err(format!(
                    "classes '{}' and '{}' share index {}",
                    other, name, index
                ));
            }
            *slot = Some(name);
        }
        Ok(Self {
            names: names.into_iter().flatten().collect(),
        })
    }
}

impl From<ClassIndexMapping> for BTreeMap<String, usize> {
    fn from(mapping: ClassIndexMapping) -> Self {
        mapping
            .names
            .into_iter()
            .enumerate()
            .map(|(index, name)| (name, index))
            .collect()
    }
}
