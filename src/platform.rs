//! JSON-lines [`Platform`] implementation.
//!
//! Every status change and relation-data write becomes one JSON object on
//! its own line:
//!
//! ```json
//! {"kind":"status","unit":"grafana/0","status":"active","message":"grafana started"}
//! {"kind":"relation-data","unit":"grafana/0","relation-id":3,"data":{"grafana-url":"http://10.0.0.5:3000"}}
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

use grafana_operator_core::models::{RawData, StatusKind, UnitStatus};

use crate::traits::Platform;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum Line<'a> {
    Status {
        unit: &'a str,
        status: StatusKind,
        message: &'a str,
    },
    RelationData {
        unit: &'a str,
        #[serde(rename = "relation-id")]
        relation_id: u32,
        data: &'a RawData,
    },
}

pub struct JsonLinesPlatform<W: Write + Send> {
    unit: String,
    out: Mutex<W>,
}

impl JsonLinesPlatform<std::io::Stdout> {
    pub fn stdout(unit: impl Into<String>) -> Self {
        Self::new(unit, std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesPlatform<W> {
    pub fn new(unit: impl Into<String>, out: W) -> Self {
        Self {
            unit: unit.into(),
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, line: &Line<'_>) -> Result<()> {
        let json = serde_json::to_string(line)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("platform output lock poisoned"))?;
        writeln!(out, "{}", json)?;
        out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl<W: Write + Send> Platform for JsonLinesPlatform<W> {
    async fn set_status(&self, status: &UnitStatus) -> Result<()> {
        self.emit(&Line::Status {
            unit: &self.unit,
            status: status.kind,
            message: &status.message,
        })
    }

    async fn write_unit_data(&self, relation_id: u32, data: &RawData) -> Result<()> {
        self.emit(&Line::RelationData {
            unit: &self.unit,
            relation_id,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emits_one_line_per_call() {
        let p = JsonLinesPlatform::new("grafana/0", Vec::new());
        p.set_status(&UnitStatus::new(StatusKind::Waiting, "waiting for database"))
            .await
            .unwrap();
        let mut data = RawData::new();
        data.insert("grafana-url".into(), "http://10.0.0.5:3000".into());
        p.write_unit_data(3, &data).await.unwrap();

        let out = String::from_utf8(p.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "status");
        assert_eq!(lines[0]["status"], "waiting");
        assert_eq!(lines[1]["kind"], "relation-data");
        assert_eq!(lines[1]["relation-id"], 3);
        assert_eq!(lines[1]["data"]["grafana-url"], "http://10.0.0.5:3000");
    }
}
