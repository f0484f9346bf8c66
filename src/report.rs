use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{JobStatus, TestJob};
use crate::store::StateStore;

/// Deterministic artifact name for a project's report.
pub fn report_filename(project_id: &str) -> String {
    format!("report_{project_id}.pdf")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Generated,
    Failed,
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportStatus::Generated => write!(f, "generated"),
            ReportStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Generated artifact record. Immutable once written; regeneration
/// replaces the record and overwrites the artifact at the same path.
#[derive(Debug, Clone)]
pub struct Report {
    pub id: Uuid,
    pub project_id: String,
    pub status: ReportStatus,
    pub generated_at: DateTime<Utc>,
    pub file_path: PathBuf,
}

/// Renders the report artifact bytes. The portal substitutes its own
/// renderer; the bundled one emits a one-page summary PDF.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(&self, project_id: &str, jobs: &[TestJob]) -> Result<Vec<u8>>;
}

/// Watches for project completion and produces the report artifact.
pub struct ReportGenerator {
    store: Arc<dyn StateStore>,
    renderer: Arc<dyn ReportRenderer>,
    report_dir: PathBuf,
    reports: Mutex<HashMap<String, Report>>,
}

impl ReportGenerator {
    pub fn new(
        store: Arc<dyn StateStore>,
        renderer: Arc<dyn ReportRenderer>,
        report_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            renderer,
            report_dir: report_dir.into(),
            reports: Mutex::new(HashMap::new()),
        }
    }

    /// Generate the project's report if every one of its jobs has reached
    /// a terminal state. Returns `None` when the project is not done yet.
    /// A render or write failure records a Failed report and is not
    /// retried; callers resubmit to regenerate.
    pub async fn maybe_generate(&self, project_id: &str) -> Result<Option<Report>> {
        let jobs = self.store.project_jobs(project_id).await?;
        if jobs.is_empty() || !jobs.iter().all(|j| j.status.is_terminal()) {
            return Ok(None);
        }

        let path = self.report_dir.join(report_filename(project_id));
        match self.write_artifact(project_id, &jobs, &path).await {
            Ok(()) => {
                let report = Report {
                    id: Uuid::new_v4(),
                    project_id: project_id.to_string(),
                    status: ReportStatus::Generated,
                    generated_at: Utc::now(),
                    file_path: path.clone(),
                };
                tracing::info!(project_id, path = %path.display(), "Report generated");
                self.reports
                    .lock()
                    .await
                    .insert(project_id.to_string(), report.clone());
                Ok(Some(report))
            }
            Err(e) => {
                let report = Report {
                    id: Uuid::new_v4(),
                    project_id: project_id.to_string(),
                    status: ReportStatus::Failed,
                    generated_at: Utc::now(),
                    file_path: path,
                };
                self.reports
                    .lock()
                    .await
                    .insert(project_id.to_string(), report);
                Err(Error::ReportGeneration {
                    project_id: project_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn write_artifact(
        &self,
        project_id: &str,
        jobs: &[TestJob],
        path: &Path,
    ) -> Result<()> {
        let bytes = self.renderer.render(project_id, jobs).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Latest report record for a project, if one was ever generated.
    pub async fn report_for(&self, project_id: &str) -> Option<Report> {
        self.reports.lock().await.get(project_id).cloned()
    }
}

/// Minimal single-page PDF with one summary line per outcome class.
#[derive(Debug, Default)]
pub struct SummaryPdfRenderer;

#[async_trait]
impl ReportRenderer for SummaryPdfRenderer {
    async fn render(&self, project_id: &str, jobs: &[TestJob]) -> Result<Vec<u8>> {
        let completed = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count();
        let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
        let cancelled = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Cancelled)
            .count();
        let line = format!(
            "Project {project_id}: {completed} completed, {failed} failed, {cancelled} cancelled"
        );
        Ok(minimal_pdf(&line))
    }
}

/// Hand-assembled one-page PDF carrying a single line of Helvetica text.
fn minimal_pdf(text: &str) -> Vec<u8> {
    let escaped = text.replace('\\', "\\\\").replace('(', "\\(").replace(')', "\\)");
    let content = format!("BT /F1 12 Tf 72 720 Td ({escaped}) Tj ET");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R \
         /Resources << /Font << /F1 5 0 R >> >> >>"
            .to_string(),
        format!(
            "<< /Length {} >>\nstream\n{content}\nendstream",
            content.len()
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];

    let mut out = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.push_str(&format!("{} 0 obj\n{body}\nendobj\n", i + 1));
    }

    let xref_offset = out.len();
    out.push_str(&format!("xref\n0 {}\n", objects.len() + 1));
    out.push_str("0000000000 65535 f \n");
    for offset in offsets {
        out.push_str(&format!("{offset:010} 00000 n \n"));
    }
    out.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        objects.len() + 1
    ));
    out.into_bytes()
}
