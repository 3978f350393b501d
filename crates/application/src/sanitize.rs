//! 消息内容转义
//!
//! 原始内容保留在 `content` 中，展示层只使用转义后的结果。

/// 转义 HTML 特殊字符并去除控制字符（换行和制表符除外）
pub fn sanitize_content(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '\n' | '\t' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(
            sanitize_content("<script>alert('x')</script>"),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt;"
        );
    }

    #[test]
    fn keeps_newlines_and_drops_control_chars() {
        assert_eq!(sanitize_content(" a\nb\u{0007}c "), "a\nbc");
    }
}
