//! 配置文件读写与带注释生成。
//!
//! 首次运行时按字段元信息写出带注释的默认配置；之后读取时与默认值逐层合并，
//! 缺字段会回写补全，用户已有的值保持不变。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读写配置文件 {path} 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("配置文件 {path} 不是合法的 YAML: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("配置校验失败: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;
    fn fields() -> &'static [FieldMeta];

    /// 合并默认值之后的语义校验。
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 读取或创建配置文件。
///
/// 路径解析：
/// - `config_path` 为 Some 时直接使用该路径（忽略 `base_dir`）
/// - 否则使用 `base_dir/FILE_NAME`
/// - 两者都为 None 时使用当前目录下的 `FILE_NAME`
pub fn load_or_create_with_base<T: ConfigSpec>(
    config_path: Option<&Path>,
    base_dir: Option<&Path>,
) -> Result<T, ConfigError> {
    let path = resolve_path::<T>(config_path, base_dir);
    ensure_parent(&path)?;

    if !path.exists() {
        let default_config = T::default();
        write_with_comments(&default_config, &path)?;
        info!(target: "startup", path = %path.display(), "已生成默认配置文件");
        return Ok(default_config);
    }

    let user_yaml = read_yaml(&path)?;
    let missing = missing_fields::<T>(&user_yaml);

    let mut merged = serde_yaml::to_value(T::default())
        .map_err(|err| ConfigError::Validation(err.to_string()))?;
    merge_values(&mut merged, user_yaml);

    let config: T =
        serde_yaml::from_value(merged).map_err(|err| ConfigError::Validation(err.to_string()))?;
    config.validate().map_err(ConfigError::Validation)?;

    if !missing.is_empty() {
        debug!(target: "startup", ?missing, "配置文件缺少字段，回写补全");
        write_with_comments(&config, &path)?;
    }

    Ok(config)
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    ensure_parent(path)?;
    let yaml = generate_yaml_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn generate_yaml_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let Value::Mapping(mapping) =
        serde_yaml::to_value(config).map_err(|err| ConfigError::Validation(err.to_string()))?
    else {
        return Err(ConfigError::Validation(
            "配置结构必须序列化为 YAML 映射".to_string(),
        ));
    };

    let mut lines = Vec::new();
    for field in T::fields() {
        if !field.description.is_empty() {
            lines.push(format!("# {}", field.description.replace('\n', "\n# ")));
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let yaml_line = serde_yaml::to_string(&Mapping::from_iter([(key, val)]))
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        lines.push(yaml_line.trim().to_string());
    }
    lines.push(String::new());

    Ok(lines.join("\n"))
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    // 空文件按空映射处理
    if raw.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn missing_fields<T: ConfigSpec>(user_yaml: &Value) -> Vec<&'static str> {
    let Value::Mapping(map) = user_yaml else {
        return T::fields().iter().map(|f| f.name).collect();
    };
    T::fields()
        .iter()
        .filter(|f| !map.contains_key(Value::String(f.name.to_string())))
        .map(|f| f.name)
        .collect()
}

fn merge_values(default: &mut Value, user: Value) {
    match (default, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                if let Some(dest_val) = dest.get_mut(&key) {
                    merge_values(dest_val, user_val);
                } else {
                    dest.insert(key, user_val);
                }
            }
        }
        // 用户显式写了 `key:` 留空时沿用默认值
        (_, Value::Null) => {}
        (dest, other) => {
            *dest = other;
        }
    }
}

fn resolve_path<T: ConfigSpec>(path: Option<&Path>, base_dir: Option<&Path>) -> PathBuf {
    match (path, base_dir) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(base)) => base.join(T::FILE_NAME),
        (None, None) => PathBuf::from(T::FILE_NAME),
    }
}

fn ensure_parent(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        endpoint: String,
        workers: u32,
        token: Option<String>,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                endpoint: "https://huggingface.co".to_string(),
                workers: 16,
                token: None,
            }
        }
    }

    impl ConfigSpec for Sample {
        const FILE_NAME: &'static str = "sample.yml";

        fn fields() -> &'static [FieldMeta] {
            &[
                FieldMeta {
                    name: "endpoint",
                    description: "服务地址",
                },
                FieldMeta {
                    name: "workers",
                    description: "并发数",
                },
                FieldMeta {
                    name: "token",
                    description: "",
                },
            ]
        }

        fn validate(&self) -> Result<(), String> {
            if self.workers == 0 {
                return Err("workers 必须大于 0".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn creates_commented_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: Sample = load_or_create_with_base(None, Some(dir.path())).unwrap();
        assert_eq!(cfg, Sample::default());

        let written = fs::read_to_string(dir.path().join("sample.yml")).unwrap();
        assert!(written.contains("# 服务地址\nendpoint: https://huggingface.co"));
        assert!(written.contains("# 并发数\nworkers: 16"));
        assert!(written.contains("token: null"));
    }

    #[test]
    fn merges_partial_file_and_backfills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.yml");
        fs::write(&path, "workers: 4\n").unwrap();

        let cfg: Sample = load_or_create_with_base(Some(&path), None).unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.endpoint, "https://huggingface.co");

        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("endpoint:"));
        assert!(rewritten.contains("workers: 4"));
    }

    #[test]
    fn null_value_keeps_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yml");
        fs::write(&path, "endpoint:\nworkers: 2\ntoken: abc\n").unwrap();

        let cfg: Sample = load_or_create_with_base(Some(&path), None).unwrap();
        assert_eq!(cfg.endpoint, "https://huggingface.co");
        assert_eq!(cfg.token.as_deref(), Some("abc"));
    }

    #[test]
    fn rejects_invalid_yaml_and_failed_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yml");

        fs::write(&path, "workers: [1, 2").unwrap();
        let err = load_or_create_with_base::<Sample>(Some(&path), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        fs::write(&path, "workers: 0\n").unwrap();
        let err = load_or_create_with_base::<Sample>(Some(&path), None).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
