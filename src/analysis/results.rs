use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Analyses, Summary};

/// Partition every analysis row lives in.
pub const PARTITION: &str = "ImageAnalysis";
pub const DEFAULT_LIST_LIMIT: usize = 10;

/// Flat table row: nested analyses are stored as JSON strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ResultEntity {
    pub partition_key: String,
    pub row_key: String,
    pub file_name: String,
    pub blob_path: String,
    pub analyzed_at: String,
    pub summary: String,
    pub color_analysis: String,
    pub object_analysis: String,
    pub text_analysis: String,
    pub metadata_analysis: String,
}

/// Partition/row keyed result store.
#[async_trait]
pub trait ResultTable: Send + Sync {
    /// Insert or replace the row at (partition_key, row_key).
    async fn upsert(&self, entity: ResultEntity) -> Result<(), String>;
    async fn get(&self, partition: &str, row: &str) -> Result<Option<ResultEntity>, String>;
    async fn query(&self, partition: &str) -> Result<Vec<ResultEntity>, String>;
}

#[derive(Default)]
pub struct InMemoryResultTable {
    rows: Mutex<BTreeMap<(String, String), ResultEntity>>,
}

impl InMemoryResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultTable for InMemoryResultTable {
    async fn upsert(&self, entity: ResultEntity) -> Result<(), String> {
        let mut rows = self.rows.lock().map_err(|e| e.to_string())?;
        rows.insert((entity.partition_key.clone(), entity.row_key.clone()), entity);
        Ok(())
    }

    async fn get(&self, partition: &str, row: &str) -> Result<Option<ResultEntity>, String> {
        let rows = self.rows.lock().map_err(|e| e.to_string())?;
        Ok(rows.get(&(partition.to_string(), row.to_string())).cloned())
    }

    async fn query(&self, partition: &str) -> Result<Vec<ResultEntity>, String> {
        let rows = self.rows.lock().map_err(|e| e.to_string())?;
        Ok(rows
            .iter()
            .filter(|((p, _), _)| p == partition)
            .map(|(_, e)| e.clone())
            .collect())
    }
}

/// Full result for one report, analyses parsed back into JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultDetail {
    pub id: String,
    pub file_name: String,
    pub blob_path: String,
    pub analyzed_at: String,
    pub summary: Summary,
    pub analyses: Analyses,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub id: String,
    pub file_name: String,
    pub analyzed_at: String,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultListing {
    pub count: usize,
    pub results: Vec<ResultSummary>,
}

fn parse_column<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, String> {
    serde_json::from_str(raw).map_err(|e| format!("corrupt {column} column: {e}"))
}

/// Look up one stored report by id.
pub async fn get_result(table: &dyn ResultTable, id: &str) -> Result<Option<ResultDetail>, String> {
    let Some(e) = table.get(PARTITION, id).await? else {
        return Ok(None);
    };
    Ok(Some(ResultDetail {
        summary: parse_column("Summary", &e.summary)?,
        analyses: Analyses {
            colors: parse_column("ColorAnalysis", &e.color_analysis)?,
            objects: parse_column("ObjectAnalysis", &e.object_analysis)?,
            text: parse_column("TextAnalysis", &e.text_analysis)?,
            metadata: parse_column("MetadataAnalysis", &e.metadata_analysis)?,
        },
        id: e.row_key,
        file_name: e.file_name,
        blob_path: e.blob_path,
        analyzed_at: e.analyzed_at,
    }))
}

/// Most recent results first; `limit` defaults to `DEFAULT_LIST_LIMIT`.
pub async fn list_results(table: &dyn ResultTable, limit: Option<usize>) -> Result<ResultListing, String> {
    let mut results = table
        .query(PARTITION)
        .await?
        .into_iter()
        .map(|e| {
            Ok(ResultSummary {
                summary: parse_column("Summary", &e.summary)?,
                id: e.row_key,
                file_name: e.file_name,
                analyzed_at: e.analyzed_at,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    // RFC3339 timestamps in UTC sort lexicographically
    results.sort_by(|a, b| b.analyzed_at.cmp(&a.analyzed_at).then_with(|| a.id.cmp(&b.id)));
    results.truncate(limit.unwrap_or(DEFAULT_LIST_LIMIT));
    Ok(ResultListing {
        count: results.len(),
        results,
    })
}
