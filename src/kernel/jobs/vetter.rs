//! Code Vetter (component C).
//!
//! Static AST analysis classifying submitted Python by name (§4.C's rule
//! table), with an optional remote-model second opinion when nothing
//! critical was found locally.

use anyhow::{Context, Result};
use rustpython_ast::Visitor;
use rustpython_parser::{ast, Parse};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::VetterConfig;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Warning,
    Critical,
}

/// Names whose call or import marks the source critical: dynamic
/// evaluation, direct OS command execution, or a dangerous symbol pulled
/// in by name.
const CRITICAL_CALLS: &[&str] = &["eval", "exec", "compile", "__import__"];
const CRITICAL_ATTRS_FROM: &[(&str, &str)] = &[
    ("os", "system"),
    ("os", "popen"),
    ("os", "Popen"),
    ("subprocess", "system"),
    ("subprocess", "Popen"),
    ("socket", "socket"),
];
const CRITICAL_BARE_MODULES: &[&str] = &[];
const WARNING_BARE_MODULES: &[&str] = &["os", "subprocess", "socket", "paramiko", "ftplib", "fabric"];

#[derive(Debug, Clone)]
pub struct VetterVerdict {
    pub safe: bool,
    pub relevant: bool,
    pub issues: Vec<String>,
    pub confidence: f32,
    pub explanation: String,
}

pub struct CodeVetter {
    config: VetterConfig,
    client: reqwest::Client,
}

impl CodeVetter {
    pub fn new(config: VetterConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self { config, client }
    }

    /// Run the pipeline described in §4.C. `competition_id` is passed to the
    /// optional remote model as relevance context.
    pub async fn vet(&self, source: &str, competition_id: &str) -> VetterVerdict {
        if !self.config.enabled {
            return VetterVerdict {
                safe: true,
                relevant: true,
                issues: vec![],
                confidence: 1.0,
                explanation: "vetting disabled".to_string(),
            };
        }

        let report = match StaticReport::analyze(source) {
            Ok(report) => report,
            Err(e) => {
                return VetterVerdict {
                    safe: false,
                    relevant: false,
                    issues: vec![format!("syntax error: {e}")],
                    confidence: 1.0,
                    explanation: "submitted code failed to parse".to_string(),
                };
            }
        };

        if report.has_critical() {
            return VetterVerdict {
                safe: false,
                relevant: true,
                issues: report.messages(),
                confidence: 1.0,
                explanation: "static analysis found a critical violation".to_string(),
            };
        }

        if self.config.quick_mode {
            return VetterVerdict {
                safe: true,
                relevant: true,
                issues: report.messages(),
                confidence: 0.6,
                explanation: "quick mode: static analysis only".to_string(),
            };
        }

        match self.ask_model(source, competition_id, &report).await {
            Ok(mut verdict) => {
                let mut combined = report.messages();
                combined.extend(verdict.issues.drain(..));
                verdict.issues = combined;
                verdict
            }
            Err(e) => {
                tracing::warn!(error = %e, "code vetter model call failed, failing closed");
                VetterVerdict {
                    safe: false,
                    relevant: false,
                    issues: report.messages(),
                    confidence: 0.0,
                    explanation: format!("model verdict unavailable: {e}"),
                }
            }
        }
    }

    async fn ask_model(
        &self,
        source: &str,
        competition_id: &str,
        report: &StaticReport,
    ) -> Result<VetterVerdict> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .context("OPENROUTER_API_KEY not configured")?;

        let prompt = format!(
            "You are a code security and relevance reviewer for a competitive programming platform.\n\
             Competition: {competition_id}\n\
             Static analysis warnings so far: {:?}\n\
             Review the following submission and respond with a single JSON object with keys \
             safe (bool), relevant (bool), issues (array of strings), confidence (0..1), explanation (string).\n\
             Submission:\n```\n{source}\n```",
            report.messages()
        );

        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": 0.1,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("request to code vetter model failed")?
            .error_for_status()
            .context("code vetter model returned an error status")?;

        let completion: ChatCompletion = response
            .json()
            .await
            .context("failed to decode code vetter model response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .context("code vetter model returned no choices")?;

        let stripped = strip_markdown_fences(content);
        let parsed: ModelVerdict =
            serde_json::from_str(&stripped).context("failed to parse code vetter model verdict as JSON")?;

        Ok(VetterVerdict {
            safe: parsed.safe,
            relevant: parsed.relevant,
            issues: parsed.issues,
            confidence: parsed.confidence,
            explanation: parsed.explanation,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    safe: bool,
    relevant: bool,
    #[serde(default)]
    issues: Vec<String>,
    confidence: f32,
    explanation: String,
}

fn strip_markdown_fences(content: &str) -> String {
    let trimmed = content.trim();
    let without_lang = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_lang.strip_suffix("```").unwrap_or(without_lang).trim().to_string()
}

struct StaticReport {
    critical: Vec<String>,
    warnings: Vec<String>,
}

impl StaticReport {
    fn analyze(source: &str) -> Result<Self> {
        let suite = ast::Suite::parse(source, "<submission>").context("invalid Python syntax")?;
        let mut visitor = RuleVisitor::new();
        for stmt in suite {
            visitor.visit_stmt(stmt);
        }
        Ok(Self {
            critical: visitor.critical,
            warnings: visitor.warnings,
        })
    }

    fn has_critical(&self) -> bool {
        !self.critical.is_empty()
    }

    fn messages(&self) -> Vec<String> {
        self.critical.iter().chain(self.warnings.iter()).cloned().collect()
    }
}

struct RuleVisitor {
    critical: Vec<String>,
    warnings: Vec<String>,
    from_imports: HashSet<String>,
}

impl RuleVisitor {
    fn new() -> Self {
        Self {
            critical: Vec::new(),
            warnings: Vec::new(),
            from_imports: HashSet::new(),
        }
    }

    fn record(&mut self, severity: Severity, message: String) {
        match severity {
            Severity::Critical => self.critical.push(message),
            Severity::Warning => self.warnings.push(message),
        }
    }
}

impl Visitor for RuleVisitor {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in &node.names {
            let name = alias.name.as_str();
            if CRITICAL_BARE_MODULES.contains(&name) {
                self.record(Severity::Critical, format!("dangerous import: {name}"));
            } else if WARNING_BARE_MODULES.contains(&name) {
                self.record(Severity::Warning, format!("imports {name}"));
            }
        }
        self.generic_visit_stmt_import(node);
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        if let Some(module) = &node.module {
            let module = module.as_str();
            for alias in &node.names {
                let name = alias.name.as_str();
                if CRITICAL_ATTRS_FROM.contains(&(module, name)) {
                    self.record(
                        Severity::Critical,
                        format!("dangerous import: from {module} import {name}"),
                    );
                    self.from_imports.insert(name.to_string());
                }
            }
            if WARNING_BARE_MODULES.contains(&module) {
                self.record(Severity::Warning, format!("imports from {module}"));
            }
        }
        self.generic_visit_stmt_import_from(node);
    }

    fn visit_expr_call(&mut self, node: ast::ExprCall) {
        match node.func.as_ref() {
            ast::Expr::Name(name) => {
                let id = name.id.as_str();
                if CRITICAL_CALLS.contains(&id) {
                    self.record(Severity::Critical, format!("calls {id}(...)"));
                } else if id == "open" {
                    self.record(Severity::Warning, "calls open(...)".to_string());
                } else if self.from_imports.contains(id) {
                    self.record(Severity::Critical, format!("calls imported dangerous symbol {id}(...)"));
                }
            }
            ast::Expr::Attribute(attr) => {
                let attr_name = attr.attr.as_str();
                if attr_name == "system" {
                    self.record(Severity::Critical, "calls *.system(...)".to_string());
                } else if let ast::Expr::Name(base) = attr.value.as_ref() {
                    if base.id.as_str() == "os" && (attr_name == "popen" || attr_name == "system") {
                        self.record(Severity::Critical, format!("calls os.{attr_name}(...)"));
                    }
                }
            }
            _ => {}
        }
        self.generic_visit_expr_call(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_config() -> VetterConfig {
        VetterConfig {
            enabled: false,
            quick_mode: false,
            api_key: None,
            api_url: String::new(),
            model: String::new(),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn quick_config() -> VetterConfig {
        VetterConfig {
            enabled: true,
            quick_mode: true,
            ..disabled_config()
        }
    }

    #[tokio::test]
    async fn disabled_vetter_always_passes() {
        let vetter = CodeVetter::new(disabled_config());
        let verdict = vetter.vet("import os\nos.system('rm -rf /')", "comp").await;
        assert!(verdict.safe);
    }

    #[tokio::test]
    async fn eval_call_is_critical() {
        let vetter = CodeVetter::new(quick_config());
        let verdict = vetter.vet("eval('1+1')", "comp").await;
        assert!(!verdict.safe);
        assert_eq!(verdict.confidence, 1.0);
    }

    #[tokio::test]
    async fn os_system_attribute_call_is_critical() {
        let vetter = CodeVetter::new(quick_config());
        let verdict = vetter.vet("import os\nos.system('ls')", "comp").await;
        assert!(!verdict.safe);
    }

    #[tokio::test]
    async fn bare_subprocess_import_is_warning_only() {
        let vetter = CodeVetter::new(quick_config());
        let verdict = vetter.vet("import subprocess\nprint('hi')", "comp").await;
        assert!(verdict.safe);
        assert!(!verdict.issues.is_empty());
    }

    #[tokio::test]
    async fn clean_code_passes_with_no_issues() {
        let vetter = CodeVetter::new(quick_config());
        let verdict = vetter.vet("print('hello world')", "comp").await;
        assert!(verdict.safe);
        assert!(verdict.issues.is_empty());
    }

    #[test]
    fn strips_json_markdown_fence() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_markdown_fences(raw), "{\"a\":1}");
    }
}
