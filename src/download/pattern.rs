//! 分片命名规律探测。
//!
//! 按固定优先级遍历已知的命名族（正则 + 计数规则 + 模板布局），第一个能给出
//! 自洽结果（序号唯一、连续、补零一致）的族胜出。纯函数，不访问网络和文件系统。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::error::{FetchError, FetchResult};
use super::models::{FileListing, PatternSpec};
use super::template::Template;

/// 可识别的权重文件扩展名，按偏好排序。
pub const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "bin", "pt", "pth", "gguf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CountRule {
    /// 文件名自带总数（`-of-00003`），所有匹配必须一致。
    EncodedTotal,
    /// 总数 = 最大序号 - 最小序号 + 1。
    IndexSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    IndexOfTotal,
    DashIndex,
    ExtensionSuffix,
}

impl Layout {
    fn render(self, prefix: &str, ext: &str, width: usize, total: Option<&str>) -> String {
        let prefix = Template::escape_literal(prefix);
        let index = if width <= 1 {
            "{i}".to_string()
        } else {
            format!("{{i:0{width}d}}")
        };
        match self {
            Layout::IndexOfTotal => {
                format!("{prefix}-{index}-of-{}.{ext}", total.unwrap_or_default())
            }
            Layout::DashIndex => format!("{prefix}-{index}.{ext}"),
            Layout::ExtensionSuffix => format!("{prefix}.{ext}.{index}"),
        }
    }
}

/// 命名族描述。`{ext}` 会被替换成扩展名分支。
struct PatternFamily {
    name: &'static str,
    regex: &'static str,
    exclude: Option<&'static str>,
    count_rule: CountRule,
    layout: Layout,
}

const FAMILIES: &[PatternFamily] = &[
    PatternFamily {
        name: "sharded-of-total",
        regex: r"^(?P<prefix>.+?)-(?P<index>\d+)-of-(?P<total>\d+)\.(?P<ext>{ext})$",
        exclude: None,
        count_rule: CountRule::EncodedTotal,
        layout: Layout::IndexOfTotal,
    },
    PatternFamily {
        name: "sharded-index",
        regex: r"^(?P<prefix>.+?)-(?P<index>\d+)\.(?P<ext>{ext})$",
        exclude: Some(r"-\d+-of-\d+\.(?:{ext})$"),
        count_rule: CountRule::IndexSpan,
        layout: Layout::DashIndex,
    },
    PatternFamily {
        name: "split-suffix",
        regex: r"^(?P<prefix>.+?)\.(?P<ext>{ext})\.(?P<index>\d+)$",
        exclude: None,
        count_rule: CountRule::IndexSpan,
        layout: Layout::ExtensionSuffix,
    },
];

struct CompiledFamily {
    family: &'static PatternFamily,
    regex: Regex,
    exclude: Option<Regex>,
}

static COMPILED: OnceLock<Vec<CompiledFamily>> = OnceLock::new();

fn compiled_families() -> &'static [CompiledFamily] {
    COMPILED.get_or_init(|| {
        let ext = WEIGHT_EXTENSIONS.join("|");
        FAMILIES
            .iter()
            .map(|family| CompiledFamily {
                family,
                regex: Regex::new(&family.regex.replace("{ext}", &ext))
                    .expect("compile pattern family"),
                exclude: family.exclude.map(|re| {
                    Regex::new(&re.replace("{ext}", &ext)).expect("compile family exclusion")
                }),
            })
            .collect()
    })
}

/// 同一族内按 (扩展名偏好, 前缀) 分组后的匹配结果。
struct Group<'a> {
    prefix: &'a str,
    ext: &'a str,
    hits: Vec<Hit<'a>>,
}

struct Hit<'a> {
    index: &'a str,
    total: Option<&'a str>,
}

pub fn detect_pattern(listing: &FileListing) -> FetchResult<PatternSpec> {
    if listing.is_empty() {
        return Err(FetchError::PatternDetectionFailed {
            reason: "仓库文件列表为空".to_string(),
        });
    }

    let mut rejections = Vec::new();
    for compiled in compiled_families() {
        let groups = collect_groups(compiled, listing);
        for group in groups.values() {
            match evaluate(compiled.family, group) {
                Ok(spec) => {
                    debug!(
                        target: "detect",
                        family = compiled.family.name,
                        template = %spec.template,
                        num_files = spec.num_files,
                        start_index = spec.start_index,
                        "命名族匹配成功"
                    );
                    return Ok(spec);
                }
                Err(reason) => {
                    debug!(
                        target: "detect",
                        family = compiled.family.name,
                        prefix = group.prefix,
                        ext = group.ext,
                        %reason,
                        "命名族不自洽，跳过"
                    );
                    rejections.push(format!(
                        "{}({}.{}): {reason}",
                        compiled.family.name, group.prefix, group.ext
                    ));
                }
            }
        }
    }

    let reason = if rejections.is_empty() {
        "没有文件符合已知的分片命名规律".to_string()
    } else {
        rejections.join("; ")
    };
    Err(FetchError::PatternDetectionFailed { reason })
}

fn collect_groups<'a>(
    compiled: &CompiledFamily,
    listing: &'a FileListing,
) -> BTreeMap<(usize, &'a str), Group<'a>> {
    let mut groups: BTreeMap<(usize, &'a str), Group<'a>> = BTreeMap::new();
    for name in listing.file_names() {
        if compiled.exclude.as_ref().is_some_and(|re| re.is_match(name)) {
            continue;
        }
        let Some(caps) = compiled.regex.captures(name) else {
            continue;
        };
        let (Some(prefix), Some(index), Some(ext)) =
            (caps.name("prefix"), caps.name("index"), caps.name("ext"))
        else {
            continue;
        };
        let (prefix, ext) = (prefix.as_str(), ext.as_str());
        let rank = WEIGHT_EXTENSIONS
            .iter()
            .position(|e| *e == ext)
            .unwrap_or(WEIGHT_EXTENSIONS.len());
        groups
            .entry((rank, prefix))
            .or_insert_with(|| Group {
                prefix,
                ext,
                hits: Vec::new(),
            })
            .hits
            .push(Hit {
                index: index.as_str(),
                total: caps.name("total").map(|m| m.as_str()),
            });
    }
    groups
}

fn evaluate(family: &PatternFamily, group: &Group<'_>) -> Result<PatternSpec, String> {
    let total = match family.count_rule {
        CountRule::EncodedTotal => {
            let first = group.hits.first().and_then(|h| h.total);
            if group.hits.iter().any(|h| h.total != first) {
                return Err("文件名中的总数不一致".to_string());
            }
            first
        }
        CountRule::IndexSpan => None,
    };

    let width = group.hits.iter().map(|h| h.index.len()).min().unwrap_or(0);
    let mut indices = Vec::with_capacity(group.hits.len());
    for hit in &group.hits {
        let value: u32 = hit
            .index
            .parse()
            .map_err(|_| format!("序号 {} 超出范围", hit.index))?;
        if format!("{value:0width$}") != hit.index {
            return Err(format!("序号 {} 的补零宽度不一致", hit.index));
        }
        indices.push(value);
    }
    indices.sort_unstable();

    if indices.windows(2).any(|w| w[0] == w[1]) {
        return Err("存在重复序号".to_string());
    }
    let (Some(&start), Some(&end)) = (indices.first(), indices.last()) else {
        return Err("没有匹配的文件".to_string());
    };
    let span = u64::from(end - start) + 1;
    if span != indices.len() as u64 {
        return Err(format!(
            "序号 {start}..={end} 不连续（缺少 {} 个）",
            span - indices.len() as u64
        ));
    }
    let span = u32::try_from(span).map_err(|_| "分片数量超出范围".to_string())?;

    let num_files = match total {
        Some(raw) => {
            let declared: u32 = raw.parse().map_err(|_| format!("总数 {raw} 超出范围"))?;
            if declared != span {
                return Err(format!("声明共 {declared} 个分片，但仅找到 {span} 个"));
            }
            declared
        }
        None => span,
    };

    let raw = family.layout.render(group.prefix, group.ext, width, total);
    let template = Template::parse(&raw).map_err(|e| e.to_string())?;
    Ok(PatternSpec {
        template,
        num_files,
        start_index: start,
    })
}
