//! 地址规范化与相似度匹配
//!
//! 规范化是尽力而为的: 无法识别的部分被丢弃, 永远不会失败.
//! 匹配偏向精确: 误合并会把一个客户的新工作挂到错误的工单上,
//! 而漏合并只会产生一个无害的重复工单.

use serde::{Deserialize, Serialize};
use strsim::levenshtein;

use crate::models::Job;

const UNIT_DESIGNATORS: &[&str] = &[
    "apt", "apartment", "unit", "suite", "ste", "bldg", "building", "fl", "floor", "rm", "room",
    "lot", "spc", "space", "trlr", "dept",
];

const SUFFIXES: &[(&str, &str)] = &[
    ("street", "st"),
    ("str", "st"),
    ("avenue", "ave"),
    ("av", "ave"),
    ("road", "rd"),
    ("drive", "dr"),
    ("boulevard", "blvd"),
    ("lane", "ln"),
    ("court", "ct"),
    ("place", "pl"),
    ("parkway", "pkwy"),
    ("highway", "hwy"),
    ("circle", "cir"),
    ("terrace", "ter"),
    ("trail", "trl"),
    ("square", "sq"),
    ("way", "way"),
];

const DIRECTIONALS: &[(&str, &str)] = &[
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
    ("northeast", "ne"),
    ("northwest", "nw"),
    ("southeast", "se"),
    ("southwest", "sw"),
];

const W_STREET: f64 = 0.55;
const W_CITY: f64 = 0.20;
const W_STATE: f64 = 0.10;
const W_ZIP: f64 = 0.15;

/// 后缀或方位词冲突时的街道分惩罚 (Elm St 与 Elm Ave 是两条街)
const STREET_CONFLICT_PENALTY: f64 = 0.7;

/// 街道名允许一处拼写差异的最短长度 (按字符)
const TYPO_MIN_LEN: usize = 6;
const TYPO_SIMILARITY: f64 = 0.9;

/// 缺门牌号或两边都缺邮编时的分数上限, 低于默认合并阈值
const UNCERTAIN_CAP: f64 = 0.85;

/// 规范化后的地址
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalAddress {
    pub number: Option<String>,
    pub directional: Option<String>,
    /// 街道名主体 (不含门牌号/方位词/后缀)
    pub street_name: Option<String>,
    pub suffix: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    /// 全部有效 token, 在结构化字段缺失时用于兜底比较
    pub tokens: Vec<String>,
}

impl CanonicalAddress {
    /// 街道行, 例如 "123 n main st"
    pub fn street_line(&self) -> Option<String> {
        let parts: Vec<&str> = [
            self.number.as_deref(),
            self.directional.as_deref(),
            self.street_name.as_deref(),
            self.suffix.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Confidence::High
        } else if score >= 0.75 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressMatch {
    pub job_id: i64,
    pub score: f64,
    pub confidence: Confidence,
}

/// 规范化自由文本地址
pub fn normalize(address: &str) -> CanonicalAddress {
    let lowered = address.to_lowercase().replace('#', " unit ");
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ',' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut segments: Vec<Vec<String>> = cleaned
        .split(',')
        .map(|seg| {
            seg.split_whitespace()
                .map(|t| t.trim_matches('-').to_string())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|seg| !seg.is_empty())
        .filter(|seg| !is_unit_segment(seg))
        .collect();

    let mut out = CanonicalAddress::default();

    // 末段: [state] [zip]
    let multi_segment = segments.len() > 1;
    if let Some(last) = segments.last_mut() {
        if let Some(pos) = last.iter().rposition(|t| is_zip(t)) {
            out.zip = Some(last[pos][..5].to_string());
            last.truncate(pos);
        }
        if let Some(t) = last.last() {
            if is_state(t) && (multi_segment || out.zip.is_some()) {
                out.state = last.pop();
            }
        }
    }
    segments.retain(|seg| !seg.is_empty());

    if let Some(first) = segments.first() {
        parse_street(&strip_unit(first), &mut out);
    }
    if segments.len() >= 2 {
        out.city = Some(segments[segments.len() - 1].join(" "));
    }

    out.tokens = [
        out.street_line(),
        out.city.clone(),
        out.state.clone(),
        out.zip.clone(),
    ]
    .into_iter()
    .flatten()
    .flat_map(|s| s.split_whitespace().map(String::from).collect::<Vec<_>>())
    .collect();
    out
}

fn is_zip(token: &str) -> bool {
    let head = token.split('-').next().unwrap_or("");
    head.len() == 5 && head.chars().all(|c| c.is_ascii_digit())
}

fn is_state(token: &str) -> bool {
    token.len() == 2 && token.chars().all(|c| c.is_ascii_alphabetic())
}

fn is_unit_segment(seg: &[String]) -> bool {
    seg.first()
        .map(|t| UNIT_DESIGNATORS.contains(&t.as_str()))
        .unwrap_or(false)
}

/// 去掉街道行中的单元号 ("apt 4b" 及其后的 token)
fn strip_unit(tokens: &[String]) -> Vec<String> {
    match tokens
        .iter()
        .skip(1)
        .position(|t| UNIT_DESIGNATORS.contains(&t.as_str()))
    {
        Some(pos) => tokens[..pos + 1].to_vec(),
        None => tokens.to_vec(),
    }
}

fn abbreviate<'a>(token: &'a str, table: &[(&str, &'a str)]) -> Option<&'a str> {
    table
        .iter()
        .find(|(long, short)| *long == token || *short == token)
        .map(|(_, short)| *short)
}

fn parse_street(tokens: &[String], out: &mut CanonicalAddress) {
    let mut rest: &[String] = tokens;

    if let Some(first) = rest.first() {
        if first.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            out.number = Some(first.clone());
            rest = &rest[1..];
        }
    }
    if rest.len() > 1 {
        if let Some(dir) = abbreviate(&rest[0], DIRECTIONALS) {
            out.directional = Some(dir.to_string());
            rest = &rest[1..];
        }
    }
    if rest.len() > 1 {
        if let Some(suffix) = rest.last().and_then(|t| abbreviate(t, SUFFIXES)) {
            out.suffix = Some(suffix.to_string());
            rest = &rest[..rest.len() - 1];
        }
    }
    if !rest.is_empty() {
        out.street_name = Some(rest.join(" "));
    }
}

fn street_similarity(a: &CanonicalAddress, b: &CanonicalAddress) -> Option<f64> {
    let (name_a, name_b) = (a.street_name.as_deref()?, b.street_name.as_deref()?);
    if let (Some(na), Some(nb)) = (&a.number, &b.number) {
        if na != nb {
            return Some(0.0);
        }
    }
    let mut sim = name_similarity(name_a, name_b);
    if conflicts(&a.suffix, &b.suffix) || conflicts(&a.directional, &b.directional) {
        sim *= STREET_CONFLICT_PENALTY;
    }
    Some(sim)
}

/// 街道名只接受完全相同, 或较长名字上的单字符拼写差异.
/// Oak 与 Oakwood, Main 与 Mainview 是不同的街.
fn name_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let shortest = a.chars().count().min(b.chars().count());
    if shortest >= TYPO_MIN_LEN && levenshtein(a, b) <= 1 {
        TYPO_SIMILARITY
    } else {
        0.0
    }
}

fn conflicts(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x != y)
}

fn exact(a: &Option<String>, b: &Option<String>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if x == y { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// 两个规范化地址的相似度, [0, 1]
///
/// 门牌号任一侧缺失, 或两侧都没有邮编时, 分数封顶在 `UNCERTAIN_CAP`.
pub fn score(a: &CanonicalAddress, b: &CanonicalAddress) -> f64 {
    let components = [
        (W_STREET, street_similarity(a, b)),
        (W_CITY, exact(&a.city, &b.city)),
        (W_STATE, exact(&a.state, &b.state)),
        (W_ZIP, exact(&a.zip, &b.zip)),
    ];

    // 街道缺失时无法可靠判断, 退化为 token 集合的 Jaccard
    let raw = if components[0].1.is_none() {
        token_jaccard(&a.tokens, &b.tokens)
    } else {
        let (weighted, weight) = components
            .iter()
            .filter_map(|(w, s)| s.map(|s| (w * s, *w)))
            .fold((0.0, 0.0), |(acc, tw), (s, w)| (acc + s, tw + w));
        if weight == 0.0 {
            0.0
        } else {
            weighted / weight
        }
    };

    let uncertain = a.number.is_none()
        || b.number.is_none()
        || (a.zip.is_none() && b.zip.is_none());
    if uncertain {
        raw.min(UNCERTAIN_CAP)
    } else {
        raw
    }
}

fn token_jaccard(a: &[String], b: &[String]) -> f64 {
    use std::collections::HashSet;
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / union as f64
}

/// 在已有工单中寻找最佳匹配; 只有单一胜者, 且分数须 >= min_score
pub fn match_address(candidate: &str, jobs: &[Job], min_score: f64) -> Option<AddressMatch> {
    let canonical = normalize(candidate);
    if canonical.is_empty() {
        return None;
    }

    let mut best: Option<AddressMatch> = None;
    for job in jobs {
        let s = score(&canonical, &normalize(&job.address));
        tracing::debug!(job_id = job.id, score = s, "address match candidate");
        if best.as_ref().map(|b| s > b.score).unwrap_or(true) {
            best = Some(AddressMatch {
                job_id: job.id,
                score: s,
                confidence: Confidence::from_score(s),
            });
        }
    }

    best.filter(|m| m.score >= min_score)
}
