/// Telegram's hard per-message limit.
pub const MESSAGE_LIMIT: usize = 4096;

/// Convert the markdown subset agents actually emit into Telegram HTML:
/// code fences, inline code, bold, and links. Everything else is escaped.
pub fn to_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    // Code fences first; their contents are escaped but not styled further.
    while let Some(start) = rest.find("```") {
        out.push_str(&inline_html(&rest[..start]));
        let after = &rest[start + 3..];
        match after.find("```") {
            Some(end) => {
                // Drop an optional language tag on the opening line.
                let block = &after[..end];
                let body = match block.find('\n') {
                    Some(nl) if !block[..nl].trim().contains(' ') && nl < 20 => &block[nl + 1..],
                    _ => block,
                };
                out.push_str("<pre>");
                out.push_str(&escape(body.trim_end()));
                out.push_str("</pre>");
                rest = &after[end + 3..];
            }
            None => {
                out.push_str(&inline_html(after));
                rest = "";
            }
        }
    }
    out.push_str(&inline_html(rest));
    out
}

fn inline_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    let bytes = text;

    while let Some((i, c)) = chars.next() {
        match c {
            '`' => {
                if let Some(end) = bytes[i + 1..].find('`') {
                    out.push_str("<code>");
                    out.push_str(&escape(&bytes[i + 1..i + 1 + end]));
                    out.push_str("</code>");
                    skip_to(&mut chars, i + 1 + end + 1);
                } else {
                    out.push_str(&escape_char(c));
                }
            }
            '*' if bytes[i + 1..].starts_with('*') => {
                if let Some(end) = bytes[i + 2..].find("**") {
                    out.push_str("<b>");
                    out.push_str(&escape(&bytes[i + 2..i + 2 + end]));
                    out.push_str("</b>");
                    skip_to(&mut chars, i + 2 + end + 2);
                } else {
                    out.push_str(&escape_char(c));
                }
            }
            '[' => match parse_link(&bytes[i..]) {
                Some((label, url, consumed)) => {
                    out.push_str(&format!(
                        "<a href=\"{}\">{}</a>",
                        escape(url),
                        escape(label)
                    ));
                    skip_to(&mut chars, i + consumed);
                }
                None => out.push_str(&escape_char(c)),
            },
            _ => out.push_str(&escape_char(c)),
        }
    }
    out
}

fn parse_link(s: &str) -> Option<(&str, &str, usize)> {
    let close = s.find(']')?;
    if !s[close + 1..].starts_with('(') {
        return None;
    }
    let url_end = s[close + 2..].find(')')?;
    let label = &s[1..close];
    let url = &s[close + 2..close + 2 + url_end];
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }
    Some((label, url, close + 2 + url_end + 1))
}

fn skip_to(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, target: usize) {
    while let Some((i, _)) = chars.peek() {
        if *i >= target {
            break;
        }
        chars.next();
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_char(c: char) -> String {
    match c {
        '&' => "&amp;".to_string(),
        '<' => "&lt;".to_string(),
        '>' => "&gt;".to_string(),
        _ => c.to_string(),
    }
}

/// Split a message into chunks under the transport limit, preferring line
/// boundaries.
pub fn chunks(text: &str, max: usize) -> Vec<String> {
    if text.len() <= max {
        return vec![text.to_string()];
    }
    let mut out = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > max && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        // A single line longer than the limit is split hard.
        if line.len() > max {
            let mut rest = line;
            while rest.len() > max {
                let cut = (0..=max).rev().find(|&i| rest.is_char_boundary(i)).unwrap_or(0);
                out.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_html() {
        assert_eq!(to_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn test_bold_and_code() {
        assert_eq!(to_html("**bold** and `code`"), "<b>bold</b> and <code>code</code>");
    }

    #[test]
    fn test_code_fence_with_language() {
        let html = to_html("before\n```rust\nlet x = 1 < 2;\n```\nafter");
        assert!(html.contains("<pre>let x = 1 &lt; 2;</pre>"));
        assert!(html.contains("before"));
        assert!(html.contains("after"));
        assert!(!html.contains("rust"));
    }

    #[test]
    fn test_link() {
        assert_eq!(
            to_html("[docs](https://example.com/a?b=1&c=2)"),
            "<a href=\"https://example.com/a?b=1&amp;c=2\">docs</a>"
        );
        // Non-http schemes are left as text.
        assert_eq!(to_html("[x](javascript:alert(1))"), "[x](javascript:alert(1))");
    }

    #[test]
    fn test_unterminated_markers_stay_literal() {
        assert_eq!(to_html("a ` b"), "a ` b");
        assert_eq!(to_html("a ** b"), "a ** b");
    }

    #[test]
    fn test_chunks_prefer_line_boundaries() {
        let text = format!("{}\n{}\n", "a".repeat(10), "b".repeat(10));
        let parts = chunks(&text, 12);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with('a'));
        assert!(parts[1].starts_with('b'));
    }

    #[test]
    fn test_chunks_split_oversized_line() {
        let text = "x".repeat(30);
        let parts = chunks(&text, 12);
        assert!(parts.len() >= 3);
        assert!(parts.iter().all(|p| p.len() <= 12));
        assert_eq!(parts.join(""), text);
    }

    #[test]
    fn test_short_message_is_single_chunk() {
        assert_eq!(chunks("hi", MESSAGE_LIMIT), vec!["hi".to_string()]);
    }
}
