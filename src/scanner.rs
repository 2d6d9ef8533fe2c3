//! Differential scanner: re-issues a captured request's injection variants
//! and flags the ones whose response diverges from the baseline.

use crate::injection::InjectionIterator;
use crate::outbound::send_request;
use crate::request::Request;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One candidate SQL-injection point, as returned by `GET /scan/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub location: String,
    pub name: String,
    #[serde(rename = "type")]
    pub finding_type: String,
}

pub struct DifferentialScanner;

impl DifferentialScanner {
    /// Re-issue the baseline request, then every injection variant, and
    /// report the variants whose response fails `Response::scan_eq` against
    /// the baseline. No deduplication, no scoring, per spec §4.7.
    pub async fn scan(request: &Request) -> Result<Vec<Finding>> {
        let baseline = send_request(request).await?;

        let mut findings = Vec::new();
        let mut iter = InjectionIterator::new(request.clone());

        while let Some(variant) = iter.next() {
            let point = iter
                .current_point()
                .expect("current_point set immediately after next()")
                .clone();

            let response = match send_request(&variant).await {
                Ok(r) => r,
                Err(_) => continue,
            };

            if !response.scan_eq(&baseline) {
                findings.push(Finding {
                    location: point.location.as_str().to_string(),
                    name: point.name,
                    finding_type: "SQL Injection".to_string(),
                });
            }
        }

        Ok(findings)
    }
}
