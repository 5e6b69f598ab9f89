//! 分片文件名模板。
//!
//! 语法：普通文本 + 一个序号占位符 `{i}` / `{i:0Nd}`，可选 `{total}` / `{total:0Nd}`
//! （展开为文件总数），`{{` 与 `}}` 表示字面量花括号。

use std::fmt;
use std::str::FromStr;

use super::error::{FetchError, FetchResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Index { width: usize },
    Total { width: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> FetchResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(FetchError::invalid_pattern(raw, "存在未闭合的 '{'"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(raw, &body)?);
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(FetchError::invalid_pattern(raw, "存在多余的 '}'"));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let index_count = segments
            .iter()
            .filter(|s| matches!(s, Segment::Index { .. }))
            .count();
        match index_count {
            0 => Err(FetchError::invalid_pattern(raw, "缺少序号占位符 {i}")),
            1 => Ok(Self {
                raw: raw.to_string(),
                segments,
            }),
            n => Err(FetchError::invalid_pattern(
                raw,
                format!("包含 {n} 个序号占位符，只允许一个"),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 序号的补零宽度（0 表示不补零）。
    pub fn width(&self) -> usize {
        self.segments
            .iter()
            .find_map(|s| match s {
                Segment::Index { width } => Some(*width),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn render(&self, index: u32, total: u32) -> String {
        let mut out = String::with_capacity(self.raw.len() + 8);
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Index { width } => out.push_str(&format!("{index:0width$}")),
                Segment::Total { width } => out.push_str(&format!("{total:0width$}")),
            }
        }
        out
    }

    /// 将文件名片段转成模板中的字面量。
    pub(crate) fn escape_literal(text: &str) -> String {
        text.replace('{', "{{").replace('}', "}}")
    }
}

fn parse_placeholder(raw: &str, body: &str) -> FetchResult<Segment> {
    let (name, spec) = match body.split_once(':') {
        Some((name, spec)) => (name, Some(spec)),
        None => (body, None),
    };
    let width = match spec {
        None => 0,
        Some(spec) => parse_width(raw, spec)?,
    };
    match name {
        "i" => Ok(Segment::Index { width }),
        "total" => Ok(Segment::Total { width }),
        other => Err(FetchError::invalid_pattern(
            raw,
            format!("未知占位符 {{{other}}}，仅支持 {{i}} 与 {{total}}"),
        )),
    }
}

fn parse_width(raw: &str, spec: &str) -> FetchResult<usize> {
    let invalid = || FetchError::invalid_pattern(raw, format!("不支持的格式 '{spec}'，应为 0Nd"));
    let digits = spec.strip_suffix('d').ok_or_else(invalid)?;
    if digits.is_empty() {
        return Ok(0);
    }
    let padded = digits.strip_prefix('0').ok_or_else(invalid)?;
    padded.parse::<usize>().map_err(|_| invalid())
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Template {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_zero_padded_index() {
        let t = Template::parse("model-{i:05d}-of-00003.safetensors").unwrap();
        assert_eq!(t.width(), 5);
        assert_eq!(t.render(2, 3), "model-00002-of-00003.safetensors");
    }

    #[test]
    fn renders_total_placeholder() {
        let t = Template::parse("model-{i:05d}-of-{total:05d}.safetensors").unwrap();
        assert_eq!(t.render(7, 163), "model-00007-of-00163.safetensors");
    }

    #[test]
    fn unpadded_index() {
        let t = Template::parse("shard_{i}.bin").unwrap();
        assert_eq!(t.width(), 0);
        assert_eq!(t.render(12, 20), "shard_12.bin");
    }

    #[test]
    fn escaped_braces_are_literal() {
        let t = Template::parse("odd{{name}}-{i:02d}.pt").unwrap();
        assert_eq!(t.render(3, 4), "odd{name}-03.pt");
        assert_eq!(Template::escape_literal("odd{name}"), "odd{{name}}");
    }

    #[test]
    fn rejects_missing_index() {
        let err = Template::parse("model.safetensors").unwrap_err();
        assert!(matches!(err, FetchError::InvalidPattern { .. }));

        let err = Template::parse("model-{total}.bin").unwrap_err();
        assert!(matches!(err, FetchError::InvalidPattern { .. }));
    }

    #[test]
    fn rejects_two_indices() {
        let err = Template::parse("{i}-{i:02d}.bin").unwrap_err();
        assert!(err.to_string().contains("2 个"));
    }

    #[test]
    fn rejects_malformed_braces_and_specs() {
        for bad in ["model-{i", "model-}{i}", "model-{n}.bin", "model-{i:5d}.bin", "m-{i:x}.pt"] {
            assert!(
                matches!(Template::parse(bad), Err(FetchError::InvalidPattern { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
