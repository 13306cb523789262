//! 附件与文本处理工具
//!
//! - 把本地图片转为 `data:image/...;base64,` 形式，随请求一起发送。
//! - 去掉助手回复里的引用标记（如 `【4:0†source】`）。

use crate::error::{ChatError, Result};
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// 读取图片文件并编码为 data URL。
///
/// 支持 png / jpg / jpeg / webp / gif，其它扩展名返回 `ChatError::Attachment`。
pub fn image_to_data_url(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();

    let mime = match extension.as_str() {
        "png" => "png",
        "jpg" | "jpeg" => "jpeg",
        "webp" => "webp",
        "gif" => "gif",
        _ => return Err(ChatError::Attachment(path.display().to_string())),
    };

    let bytes = std::fs::read(path)?;
    let b64 = general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:image/{};base64,{}", mime, b64))
}

/// 引用标记，如 `【4:0†source】`。不跨行。
static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【[^】\n]*】").expect("citation pattern is valid"));

/// 删除 `【...】` 引用标记并去掉首尾空白。
pub fn strip_citations(content: &str) -> String {
    CITATION.replace_all(content, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn citations_are_removed() {
        assert_eq!(
            strip_citations("Stop sign【4:0†source】 means stop.【1†x】 "),
            "Stop sign means stop."
        );
        assert_eq!(strip_citations("  plain  "), "plain");
    }

    #[test]
    fn unterminated_or_multiline_marker_is_kept() {
        assert_eq!(strip_citations("a【open"), "a【open");
        assert_eq!(strip_citations("a【x\ny】b"), "a【x\ny】b");
        assert_eq!(strip_citations("【a【b】c"), "c");
    }

    #[test]
    fn image_becomes_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sign.PNG");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();
        assert_eq!(image_to_data_url(&path).unwrap(), "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn non_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "x").unwrap();
        assert!(matches!(image_to_data_url(&path), Err(ChatError::Attachment(_))));
    }
}
