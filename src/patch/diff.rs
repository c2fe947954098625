//! `DiffApplier` - the shipped patch engine
//!
//! A file block is a fenced code block whose first line names the target
//! path in a comment:
//!
//! ````text
//! ```tsx
//! // /app/frontend/app/settings/page.tsx
//! export default function Settings() { ... }
//! ```
//! ````
//!
//! `#`, `/* ... */` and `<!-- ... -->` path comments are recognised too.
//! Complete blocks are written verbatim. Blocks that elide parts of the file
//! ("... existing code ...") or hit a known pitfall are merged against the
//! current file by a fast model completion first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{parse_eslint, ApplyReport, PatchEngine, PatchEngineFactory, PatchError};
use crate::llm::{ChatMessage, ChatRequest, ModelClient};
use crate::metrics::{MODEL_CALL_DURATION, PATCHES_APPLIED};
use crate::sandbox::Sandbox;

lazy_static! {
    static ref FILE_BLOCK_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"```[\w.]+\n[#/]+ (\S+)\n([\s\S]+?)```").expect("valid hash/slash block pattern"),
        Regex::new(r"```[\w.]+\n[/*]+ (\S+) \*/\n([\s\S]+?)```").expect("valid c-comment block pattern"),
        Regex::new(r"```[\w.]+\n<!-- (\S+) -->\n([\s\S]+?)```").expect("valid html-comment block pattern"),
    ];

    static ref CODE_FENCE: Regex =
        Regex::new(r"```(?:[\w.]+\n)?([\s\S]+?)```").expect("valid code fence pattern");

    /// Known pitfalls: pattern in the block -> instruction for the merge
    static ref MERGE_TIPS: Vec<(Regex, &'static str)> = vec![
        (
            Regex::new(r"<Link[^>]*>[\S\s]*?<a[^>]*>").expect("valid tip pattern"),
            "All <Link> tags should be free of <a> tags. Remove all <a> tags from <Link> tags.",
        ),
        (
            Regex::new(r"<CardBody").expect("valid tip pattern"),
            "Ensure in Shadcn UI, <Card>s use <CardContent> instead of <CardBody>.",
        ),
        (
            Regex::new(r"<Slider").expect("valid tip pattern"),
            "Ensure <Slider />s in Shadcn have at least values= or a min= and a max= attribute.",
        ),
        (
            Regex::new(r"Layout\(").expect("valid tip pattern"),
            "Ensure Layouts in Next.js retain <html> and <body> tags.",
        ),
        (
            Regex::new(r"use-toast").expect("valid tip pattern"),
            "Ensure the import is from \"@/hooks/use-toast\" (rather than components)",
        ),
    ];
}

/// Phrases that mean "this block is not the whole file"
const ELISION_MARKERS: &[&str] = &[
    "... (",
    "... keep",
    "... existing",
    "... rest",
    "... removed",
    "the same...",
    "Add this at",
];

const MISSING_FILE_PLACEHOLDER: &str = "(file does not yet exist)";

const MERGE_SYSTEM_PROMPT: &str = r#"You are a senior software engineer that applies code changes to a file. Given the <original-content>, the <diff>, and the <adjustments>, apply the changes to the content.

- You must apply the <adjustments> (if provided) even if this conflicts with the original diff
- You must follow instructions from within comments in <diff> (e.g. <!-- remove this -->)
- You must maintain the layout of the file especially in languages/formats where it matters. Carefully preserve imports.
- Ensure you maintain sections of the original file IF the diff denotes them with "... existing code ..." or other similar comment-based instructions
- You must provide the FULL content of the new file. All "... existing code ...", etc should be replaced with the actual content.

Respond ONLY with the updated content in a code block."#;

/// Strip every file block, leaving the prose around it
pub fn remove_file_changes(content: &str) -> String {
    FILE_BLOCK_PATTERNS
        .iter()
        .fold(content.to_string(), |text, pattern| {
            pattern.replace_all(&text, "").into_owned()
        })
}

fn tips_for(diff: &str) -> Vec<&'static str> {
    MERGE_TIPS
        .iter()
        .filter(|(pattern, _)| pattern.is_match(diff))
        .map(|(_, tip)| *tip)
        .collect()
}

fn needs_merge(diff: &str, tips: &[&str]) -> bool {
    !tips.is_empty() || ELISION_MARKERS.iter().any(|marker| diff.contains(marker))
}

/// Body of the first fenced block, or the whole text if there is none
fn extract_code_block(content: &str) -> String {
    CODE_FENCE
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|body| body.as_str().trim().to_string())
        .unwrap_or_else(|| content.trim().to_string())
}

fn markdown_language(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "js" | "jsx" | "mjs" => "javascript",
        "ts" | "tsx" | "mts" => "typescript",
        "py" => "python",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "md" => "markdown",
        _ => "",
    }
}

struct Job {
    path: String,
    diff: String,
    lint_errors: Option<String>,
}

enum Written {
    Direct,
    Merged,
}

/// Patch engine bound to one sandbox for one turn
pub struct DiffApplier {
    sandbox: Arc<dyn Sandbox>,
    model: Arc<dyn ModelClient>,
    merge_model: String,
    lint_dir: String,
    total_content: String,
    /// (path, block start offset) pairs already picked up
    seen: HashSet<(String, usize)>,
    /// Latest block per path, kept for lint re-merges
    latest: HashMap<String, String>,
    /// Paths with a block not yet applied, in first-seen order
    pending: Vec<String>,
}

impl DiffApplier {
    /// # Arguments
    /// * `sandbox` - Where files are read and written
    /// * `model` - Client used for merges
    /// * `merge_model` - Model name for merges (usually the fast model)
    /// * `lint_dir` - Directory relative lint paths are resolved against
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        model: Arc<dyn ModelClient>,
        merge_model: impl Into<String>,
        lint_dir: impl Into<String>,
    ) -> Self {
        Self {
            sandbox,
            model,
            merge_model: merge_model.into(),
            lint_dir: lint_dir.into(),
            total_content: String::new(),
            seen: HashSet::new(),
            latest: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn scan(&mut self) {
        for pattern in FILE_BLOCK_PATTERNS.iter() {
            for caps in pattern.captures_iter(&self.total_content) {
                let (Some(whole), Some(path), Some(body)) = (caps.get(0), caps.get(1), caps.get(2))
                else {
                    continue;
                };
                let path = path.as_str().to_string();
                if !self.seen.insert((path.clone(), whole.start())) {
                    continue;
                }
                debug!(path = %path, "file block complete");
                self.latest.insert(path.clone(), body.as_str().trim().to_string());
                if !self.pending.contains(&path) {
                    self.pending.push(path);
                }
            }
        }
    }

    async fn run(&self, jobs: Vec<Job>) -> ApplyReport {
        let results = join_all(jobs.iter().map(|job| async move {
            (job.path.clone(), self.materialize(job).await)
        }))
        .await;

        let mut report = ApplyReport::default();
        for (path, result) in results {
            match result {
                Ok(Written::Direct) => {
                    PATCHES_APPLIED.with_label_values(&["written"]).inc();
                    report.written.push(path);
                }
                Ok(Written::Merged) => {
                    PATCHES_APPLIED.with_label_values(&["merged"]).inc();
                    report.written.push(path);
                }
                Err(e) => {
                    PATCHES_APPLIED.with_label_values(&["failed"]).inc();
                    warn!(path = %path, error = %e, "failed to apply file block");
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        report
    }

    async fn materialize(&self, job: &Job) -> Result<Written, PatchError> {
        let tips = tips_for(&job.diff);

        if job.lint_errors.is_none() && !needs_merge(&job.diff, &tips) {
            debug!(path = %job.path, "writing file block directly");
            self.sandbox
                .write_file(&job.path, &format!("{}\n", job.diff))
                .await?;
            return Ok(Written::Direct);
        }

        debug!(path = %job.path, tips = tips.len(), "merging file block");
        let original = self
            .sandbox
            .read_file(&job.path, false)
            .await
            .unwrap_or_else(|_| MISSING_FILE_PLACEHOLDER.to_string());
        let merged = self
            .merge(&job.path, &original, &job.diff, &tips, job.lint_errors.as_deref())
            .await?;
        self.sandbox
            .write_file(&job.path, &format!("{}\n", merged))
            .await?;
        Ok(Written::Merged)
    }

    async fn merge(
        &self,
        path: &str,
        original: &str,
        diff: &str,
        tips: &[&str],
        lint_errors: Option<&str>,
    ) -> Result<String, PatchError> {
        let lang = markdown_language(path);
        let mut adjustments = tips
            .iter()
            .map(|tip| format!(" - {}", tip))
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(errors) = lint_errors {
            adjustments.push_str(&format!(
                "\n\n<lint-output>Avoid the following errors from a previous attempt. \n```\n{}\n```</lint-output>",
                errors
            ));
        }

        let user = format!(
            "{path}\n\n<original-content>\n```{lang}\n{original}\n```\n</original-content>\n\n\
             <diff>\n```{lang}\n{diff}\n```\n</diff>\n\n<adjustments>\n{adjustments}\n</adjustments>",
        );

        let request = ChatRequest::new(
            self.merge_model.clone(),
            vec![ChatMessage::system(MERGE_SYSTEM_PROMPT), ChatMessage::user(user)],
        );

        let started = Instant::now();
        let output = self.model.complete(request).await;
        MODEL_CALL_DURATION
            .with_label_values(&["merge"])
            .observe(started.elapsed().as_secs_f64());

        Ok(extract_code_block(&output?))
    }
}

#[async_trait]
impl PatchEngine for DiffApplier {
    fn ingest(&mut self, fragment: &str) {
        self.total_content.push_str(fragment);
        if fragment.contains('`') {
            self.scan();
        }
    }

    async fn apply(&mut self) -> Result<ApplyReport, PatchError> {
        // a block may have closed on a fragment without a backtick
        self.scan();

        let jobs: Vec<Job> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter_map(|path| {
                self.latest.get(&path).map(|diff| Job {
                    diff: diff.clone(),
                    path,
                    lint_errors: None,
                })
            })
            .collect();

        if jobs.is_empty() {
            return Ok(ApplyReport::default());
        }

        info!(files = jobs.len(), "applying file blocks");
        Ok(self.run(jobs).await)
    }

    async fn apply_lint_fixes(&mut self, lint_output: &str) -> Result<ApplyReport, PatchError> {
        let jobs: Vec<Job> = parse_eslint(lint_output, &self.lint_dir)
            .into_iter()
            .filter_map(|(path, errors)| match self.latest.get(&path) {
                Some(diff) => Some(Job {
                    diff: diff.clone(),
                    path,
                    lint_errors: Some(errors.join("\n")),
                }),
                None => {
                    debug!(path = %path, "lint error in a file this turn did not touch");
                    None
                }
            })
            .collect();

        if jobs.is_empty() {
            return Ok(ApplyReport::default());
        }

        info!(files = jobs.len(), "re-applying file blocks with lint errors");
        Ok(self.run(jobs).await)
    }

    fn total_content(&self) -> &str {
        &self.total_content
    }
}

/// Creates a `DiffApplier` per turn
#[derive(Clone)]
pub struct DiffApplierFactory {
    model: Arc<dyn ModelClient>,
    merge_model: String,
    lint_dir: String,
}

impl DiffApplierFactory {
    pub fn new(
        model: Arc<dyn ModelClient>,
        merge_model: impl Into<String>,
        lint_dir: impl Into<String>,
    ) -> Self {
        Self {
            model,
            merge_model: merge_model.into(),
            lint_dir: lint_dir.into(),
        }
    }
}

impl PatchEngineFactory for DiffApplierFactory {
    fn create(&self, sandbox: Arc<dyn Sandbox>) -> Box<dyn PatchEngine> {
        Box::new(DiffApplier::new(
            sandbox,
            Arc::clone(&self.model),
            self.merge_model.clone(),
            self.lint_dir.clone(),
        ))
    }
}
