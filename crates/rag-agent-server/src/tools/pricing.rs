use super::{Tool, ToolError, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRecord {
    pub service_type: String,
    pub name: String,
    pub price_idr: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogueFile {
    services: Vec<PriceRecord>,
}

/// Internal service price catalogue, loaded from TOML and hot-reloaded when
/// the file changes on disk.
#[derive(Clone)]
pub struct PricingCatalogue {
    path: PathBuf,
    records: Arc<RwLock<Vec<PriceRecord>>>,
}

impl PricingCatalogue {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = Self::parse_file(&path)?;
        info!("Loaded pricing catalogue: {} services", records.len());

        Ok(Self {
            path,
            records: Arc::new(RwLock::new(records)),
        })
    }

    fn parse_file(path: &PathBuf) -> Result<Vec<PriceRecord>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pricing catalogue at {}", path.display()))?;
        let parsed: CatalogueFile =
            toml::from_str(&raw).context("Failed to parse pricing catalogue")?;
        Ok(parsed.services)
    }

    /// Watch the catalogue file and swap records on change.
    pub fn start_watcher(&self) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        let path = self.path.clone();
        let records = self.records.clone();

        std::thread::spawn(move || {
            // Keep the watcher alive for the lifetime of this thread.
            let _watcher = watcher;

            for event in rx {
                match event {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        match Self::parse_file(&path) {
                            Ok(new_records) => {
                                info!(
                                    "Pricing catalogue reloaded: {} services",
                                    new_records.len()
                                );
                                *records.blocking_write() = new_records;
                            }
                            Err(e) => warn!("Pricing catalogue reload failed: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Pricing watcher error: {}", e),
                }
            }
        });

        info!("Pricing catalogue watcher started for {}", self.path.display());
        Ok(())
    }

    pub async fn lookup(&self, service_type: &str) -> Option<PriceRecord> {
        let needle = service_type.trim().to_lowercase();
        let records = self.records.read().await;

        records
            .iter()
            .find(|r| r.service_type == needle)
            .or_else(|| {
                records.iter().find(|r| {
                    r.service_type.contains(&needle) || r.name.to_lowercase().contains(&needle)
                })
            })
            .cloned()
    }

    pub async fn service_types(&self) -> Vec<String> {
        self.records
            .read()
            .await
            .iter()
            .map(|r| r.service_type.clone())
            .collect()
    }
}

pub struct PricingLookupTool {
    catalogue: PricingCatalogue,
}

impl PricingLookupTool {
    pub fn new(catalogue: PricingCatalogue) -> Self {
        Self { catalogue }
    }
}

fn format_idr(amount: i64) -> String {
    let digits = amount.abs().to_string();
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-Rp {}", grouped)
    } else {
        format!("Rp {}", grouped)
    }
}

#[async_trait]
impl Tool for PricingLookupTool {
    fn name(&self) -> &'static str {
        "pricing_lookup"
    }

    fn description(&self) -> &'static str {
        "Look up the internal price for a service (visa applications, company setup, \
         tax filings). Input a service type like 'investor_kitas_e28a' or a keyword \
         like 'pt pma'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "service_type": {
                    "type": "string",
                    "description": "Service type id or keyword"
                }
            },
            "required": ["service_type"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let service_type = args["service_type"].as_str().unwrap_or_default();

        match self.catalogue.lookup(service_type).await {
            Some(record) => {
                let mut observation = format!(
                    "{} ({}): {}",
                    record.name,
                    record.service_type,
                    format_idr(record.price_idr)
                );
                if let Some(notes) = &record.notes {
                    observation.push_str(&format!("\nNotes: {}", notes));
                }
                Ok(ToolOutput::text(observation))
            }
            None => {
                let known = self.catalogue.service_types().await;
                Ok(ToolOutput::text(format!(
                    "No price found for '{}'. Known service types: {}",
                    service_type,
                    known.join(", ")
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue() -> PricingCatalogue {
        PricingCatalogue {
            path: PathBuf::from("unused"),
            records: Arc::new(RwLock::new(vec![
                PriceRecord {
                    service_type: "investor_kitas_e28a".into(),
                    name: "Investor KITAS E28A (2 years)".into(),
                    price_idr: 21_000_000,
                    notes: None,
                },
                PriceRecord {
                    service_type: "pt_pma_setup".into(),
                    name: "PT PMA company establishment".into(),
                    price_idr: 35_000_000,
                    notes: Some("Includes NIB via OSS-RBA.".into()),
                },
            ])),
        }
    }

    #[tokio::test]
    async fn test_exact_lookup() {
        let record = catalogue().lookup("investor_kitas_e28a").await.unwrap();
        assert_eq!(record.price_idr, 21_000_000);
    }

    #[tokio::test]
    async fn test_keyword_lookup_matches_name() {
        let record = catalogue().lookup("pt pma").await.unwrap();
        assert_eq!(record.service_type, "pt_pma_setup");
    }

    #[tokio::test]
    async fn test_unknown_service_lists_known_types() {
        let tool = PricingLookupTool::new(catalogue());
        let output = tool
            .execute(json!({"service_type": "yacht_registration"}))
            .await
            .unwrap();
        assert!(output.observation.contains("No price found"));
        assert!(output.observation.contains("investor_kitas_e28a"));
    }

    #[test]
    fn test_idr_formatting() {
        assert_eq!(format_idr(21_000_000), "Rp 21.000.000");
        assert_eq!(format_idr(1_500), "Rp 1.500");
        assert_eq!(format_idr(900), "Rp 900");
    }
}
