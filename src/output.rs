//! 搜索结果的输出格式
//!
//! JSON 文档是一个数组，每个元素的键依次为 `cellId`、`distance`、`rank`，
//! 需要附加信息时，后面跟着 `image`、`x`、`y` 和其余按键名排序的字段。

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::db::{CellId, CellMetadata};
use crate::error::Result;
use crate::query::MatchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    /// 纯文本表格，用于日志和调试
    Table,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    pub include_metadata: bool,
    pub pretty: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchRecord {
    cell_id: CellId,
    distance: f64,
    rank: usize,
    #[serde(flatten)]
    metadata: CellMetadata,
}

impl MatchRecord {
    fn new(result: &MatchResult, include_metadata: bool) -> Self {
        let metadata = match (&result.metadata, include_metadata) {
            (Some(metadata), true) => metadata.clone(),
            _ => CellMetadata::default(),
        };
        Self { cell_id: result.cell_id.clone(), distance: result.distance, rank: result.rank, metadata }
    }
}

impl From<MatchRecord> for MatchResult {
    fn from(record: MatchRecord) -> Self {
        let metadata = (!record.metadata.is_empty()).then_some(record.metadata);
        Self { cell_id: record.cell_id, distance: record.distance, rank: record.rank, metadata }
    }
}

fn records(results: &[MatchResult], options: OutputOptions) -> Result<Vec<MatchRecord>> {
    results
        .iter()
        .map(|r| {
            let record = MatchRecord::new(r, options.include_metadata);
            record.metadata.validate()?;
            Ok(record)
        })
        .collect()
}

/// 序列化为 JSON 文本
pub fn serialize(results: &[MatchResult], options: OutputOptions) -> Result<String> {
    let records = records(results, options)?;
    let text = if options.pretty {
        serde_json::to_string_pretty(&records)?
    } else {
        serde_json::to_string(&records)?
    };
    Ok(text)
}

pub fn to_value(results: &[MatchResult], options: OutputOptions) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(records(results, options)?)?)
}

/// 解析 JSON 文本，`cellId`、`distance`、`rank` 与序列化前完全一致
pub fn deserialize(text: &str) -> Result<Vec<MatchResult>> {
    let records: Vec<MatchRecord> = serde_json::from_str(text)?;
    Ok(records.into_iter().map(MatchResult::from).collect())
}

pub fn render(results: &[MatchResult], format: OutputFormat, options: OutputOptions) -> Result<String> {
    match format {
        OutputFormat::Json => serialize(results, options),
        OutputFormat::Table => Ok(render_table(results, options.include_metadata)),
    }
}

fn render_table(results: &[MatchResult], include_metadata: bool) -> String {
    let id_width = results.iter().map(|r| r.cell_id.as_str().len()).max().unwrap_or(0).max(6);
    let mut out = String::new();
    let _ = write!(out, "{:>4}  {:<id_width$}  {:>12}", "rank", "cellId", "distance");
    if include_metadata {
        out.push_str("  image");
    }
    out.push('\n');

    for r in results {
        let _ = write!(out, "{:>4}  {:<id_width$}  {:>12.6}", r.rank, r.cell_id.as_str(), r.distance);
        if let Some(meta) = r.metadata.as_ref().filter(|_| include_metadata) {
            let _ = write!(out, "  {}", meta.image.as_deref().unwrap_or("-"));
            if let (Some(x), Some(y)) = (meta.x, meta.y) {
                let _ = write!(out, " ({x:.1}, {y:.1})");
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn results() -> Vec<MatchResult> {
        let mut meta = CellMetadata::with_image("slide-1.svs").at(10.5, 20.25);
        meta.extra.insert("area".into(), serde_json::json!(31.5));
        meta.extra.insert("class".into(), serde_json::json!("Tumor"));
        vec![
            MatchResult { cell_id: "A".into(), distance: 0.0, rank: 1, metadata: Some(meta) },
            MatchResult {
                cell_id: "C".into(),
                distance: std::f64::consts::SQRT_2,
                rank: 2,
                metadata: None,
            },
        ]
    }

    #[test]
    fn test_key_order() {
        let options = OutputOptions { include_metadata: true, pretty: false };
        let json = serialize(&results(), options).unwrap();
        assert_eq!(
            json,
            r#"[{"cellId":"A","distance":0.0,"rank":1,"image":"slide-1.svs","x":10.5,"y":20.25,"area":31.5,"class":"Tumor"},{"cellId":"C","distance":1.4142135623730951,"rank":2}]"#
        );
    }

    #[test]
    fn test_metadata_is_omitted_by_default() {
        let json = serialize(&results(), OutputOptions::default()).unwrap();
        assert_eq!(
            json,
            r#"[{"cellId":"A","distance":0.0,"rank":1},{"cellId":"C","distance":1.4142135623730951,"rank":2}]"#
        );
    }

    #[test]
    fn test_round_trip() {
        let options = OutputOptions { include_metadata: true, pretty: true };
        let original = results();
        let parsed = deserialize(&serialize(&original, options).unwrap()).unwrap();
        assert_eq!(parsed, original);

        let parsed = deserialize(&serialize(&original, OutputOptions::default()).unwrap()).unwrap();
        for (a, b) in parsed.iter().zip(&original) {
            assert_eq!(a.cell_id, b.cell_id);
            assert_eq!(a.distance.to_bits(), b.distance.to_bits());
            assert_eq!(a.rank, b.rank);
            assert!(a.metadata.is_none());
        }
    }

    #[test]
    fn test_reserved_metadata_key_is_rejected() {
        let mut results = results();
        let meta = results[0].metadata.as_mut().unwrap();
        meta.extra.insert("rank".into(), serde_json::json!("high"));
        let options = OutputOptions { include_metadata: true, pretty: false };
        assert!(matches!(serialize(&results, options), Err(Error::Validation(_))));
        assert!(matches!(to_value(&results, options), Err(Error::Validation(_))));

        // 不输出附加信息时不受影响，且仍能完整读回
        let parsed = deserialize(&serialize(&results, OutputOptions::default()).unwrap()).unwrap();
        assert_eq!(parsed[0].cell_id, results[0].cell_id);
        assert_eq!(parsed[0].rank, 1);
    }

    #[test]
    fn test_to_value() {
        let value = to_value(&results(), OutputOptions::default()).unwrap();
        assert_eq!(value[1]["cellId"], "C");
        assert_eq!(value[1]["rank"], 2);
    }

    #[test]
    fn test_render_table() {
        let options = OutputOptions { include_metadata: true, pretty: false };
        let table = render(&results(), OutputFormat::Table, options).unwrap();
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("rank"));
        assert!(lines[1].contains("slide-1.svs (10.5, 20.2)") || lines[1].contains("slide-1.svs (10.5, 20.3)"));
        assert!(lines[2].contains("1.414214"));
    }

    #[test]
    fn test_empty_results() {
        assert_eq!(serialize(&[], OutputOptions::default()).unwrap(), "[]");
        assert!(deserialize("[]").unwrap().is_empty());
    }
}
