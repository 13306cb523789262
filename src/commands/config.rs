use crate::error::{ChatError, Result};
use crate::models::{AppConfig, Assistant}; // 导入模型定义
use std::fs; // 导入标准库文件系统模块
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 默认配置文件：系统配置目录下的 `aio-chat/config.json`。
pub fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| ChatError::Config("无法获取配置目录".into()))?;
    path.push("aio-chat");
    path.push("config.json");
    Ok(path)
}

/// 保存应用程序通用配置
pub fn save_app_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }

    // 将配置对象序列化为格式化后的 JSON 字符串
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    info!(target: "aio_chat::config", "config saved to {}", path.display());
    Ok(())
}

/// 读取应用程序通用配置
///
/// 文件不存在时返回内置默认配置；文件存在但内容非法时报错，不会静默覆盖。
pub fn load_app_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!(target: "aio_chat::config", "{} missing, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)
        .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;

    if config.assistants.is_empty() {
        return Err(ChatError::Config(format!("{}: no assistants configured", path.display())));
    }
    Ok(config)
}

/// 命令行或环境变量给出的 URL 覆盖配置文件里的值。
pub fn apply_overrides(config: &mut AppConfig, api_url: Option<String>) {
    if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
        debug!(target: "aio_chat::config", "apiUrl overridden: {}", url);
        config.api_url = url;
    }
}

pub fn find_assistant<'a>(config: &'a AppConfig, id: &str) -> Result<&'a Assistant> {
    config
        .find_assistant(id)
        .ok_or_else(|| ChatError::UnknownAssistant(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_app_config(&dir.path().join("none.json")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let mut config = AppConfig::default();
        config.api_url = "http://127.0.0.1:9/api/chat".into();
        config.assistants.truncate(1);

        save_app_config(&path, &config).unwrap();
        assert_eq!(load_app_config(&path).unwrap(), config);
    }

    #[test]
    fn hand_written_file_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "apiUrl": "http://proxy/api/chat",
                "assistants": [
                    {"id": "bot", "name": "Bot", "backend": {"kind": "webhook", "url": "http://hook", "inputField": "chatInput"}}
                ]
            }"#,
        )
        .unwrap();

        let config = load_app_config(&path).unwrap();
        assert_eq!(config.request_timeout_secs, 120);
        let bot = find_assistant(&config, "bot").unwrap();
        assert_eq!(
            bot.backend,
            BackendKind::Webhook {
                url: "http://hook".into(),
                input_field: "chatInput".into(),
                extract: vec![],
                tools_url: None,
            }
        );
        assert_eq!(config.welcome_for(bot), "Hello! I'm Bot. How can I help you today?");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(load_app_config(&path), Err(ChatError::Config(_))));

        fs::write(&path, r#"{"apiUrl": "x", "assistants": []}"#).unwrap();
        assert!(matches!(load_app_config(&path), Err(ChatError::Config(_))));
    }

    #[test]
    fn overrides_and_lookup() {
        let mut config = AppConfig::default();
        apply_overrides(&mut config, Some("  ".into()));
        assert_eq!(config.api_url, "http://localhost:5173/api/chat");
        apply_overrides(&mut config, Some("http://other/api".into()));
        assert_eq!(config.api_url, "http://other/api");

        assert!(matches!(
            find_assistant(&config, "ghost"),
            Err(ChatError::UnknownAssistant(id)) if id == "ghost"
        ));
    }
}
