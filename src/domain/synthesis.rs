//! Structured final report produced by a synthesis step.

use serde::{Deserialize, Serialize};

/// The report a structured synthesis step must return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalSynthesis {
    /// Finalized, testable hypothesis
    pub hypothesis: String,

    /// Brief summary of the proposed experimental steps
    pub protocol_summary: String,

    /// Core metrics and conclusions from the analysis steps
    pub analysis_findings: String,

    /// URLs or payload keys of key prior-art documents
    #[serde(default)]
    pub prior_art_reference_links: Vec<String>,

    /// Recommended follow-up for human researchers
    pub next_steps: String,
}

fn is_payload_key(reference: &str) -> bool {
    reference.len() == 64 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

impl FinalSynthesis {
    /// Field-level checks the JSON shape alone cannot express
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("hypothesis", &self.hypothesis),
            ("protocol_summary", &self.protocol_summary),
            ("analysis_findings", &self.analysis_findings),
            ("next_steps", &self.next_steps),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{} cannot be empty", field));
            }
        }

        for link in &self.prior_art_reference_links {
            let link = link.trim();
            let is_url = link.starts_with("https://") || link.starts_with("http://");
            if !is_url && !is_payload_key(link) {
                return Err(format!(
                    "prior art reference '{}' is neither a URL nor a payload key",
                    link
                ));
            }
        }

        Ok(())
    }

    /// Markdown body for a published report
    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "## Hypothesis\n\n{}\n\n## Protocol\n\n{}\n\n## Analysis findings\n\n{}\n",
            self.hypothesis.trim(),
            self.protocol_summary.trim(),
            self.analysis_findings.trim()
        );

        if !self.prior_art_reference_links.is_empty() {
            out.push_str("\n## Prior art\n\n");
            for link in &self.prior_art_reference_links {
                out.push_str(&format!("- {}\n", link.trim()));
            }
        }

        out.push_str(&format!("\n## Next steps\n\n{}\n", self.next_steps.trim()));
        out
    }
}
