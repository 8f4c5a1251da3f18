//! Static validation of submitted Python code.
//!
//! Every fragment is parsed into a syntax tree and walked once. Nothing is
//! imported or executed. Findings from all fragments are accumulated so a
//! caller can fix every problem in a single round-trip.
//!
//! The walk is a best-effort filter; workers still run under OS-level limits
//! (see [`super::limits`]).

use std::collections::HashSet;

use rustpython_ast::{self as ast, Visitor};
use rustpython_parser::Parse;
use serde::{Deserialize, Serialize};

use super::policy::ValidatorPolicy;
use super::submission::{CodeSubmission, Fragment, SourceFragments};

/// Name of the entry point `function_code` must define.
pub const ENTRY_POINT: &str = "custom_function";

/// Verdict of the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationResult {
    Accepted,
    Rejected { reasons: Vec<String> },
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationResult::Accepted)
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            ValidationResult::Accepted => &[],
            ValidationResult::Rejected { reasons } => reasons,
        }
    }
}

/// A single finding of the validator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Violation {
    Syntax { fragment: Fragment, detail: String },
    Import(String),
    Call(String),
    Name(String),
    Attribute(String),
    MissingEntryPoint,
    AsyncEntryPoint,
    EntryPointArity(usize),
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Syntax { fragment, detail } => {
                write!(f, "syntax error: {detail} (in {fragment})")
            }
            Violation::Import(module) => write!(f, "forbidden import: {module}"),
            Violation::Call(name) => write!(f, "forbidden call: {name}"),
            Violation::Name(name) => write!(f, "forbidden name: {name}"),
            Violation::Attribute(attr) => write!(f, "forbidden attribute: {attr}"),
            Violation::MissingEntryPoint => write!(
                f,
                "missing {ENTRY_POINT}: function_code must define `def {ENTRY_POINT}(text)`"
            ),
            Violation::AsyncEntryPoint => {
                write!(f, "{ENTRY_POINT} must be a plain `def`, not `async def`")
            }
            Violation::EntryPointArity(found) => write!(
                f,
                "{ENTRY_POINT} must accept exactly one parameter (found {found})"
            ),
        }
    }
}

/// Ordered, de-duplicated violation list.
#[derive(Debug, Default)]
struct Findings {
    seen: HashSet<Violation>,
    ordered: Vec<Violation>,
}

impl Findings {
    fn push(&mut self, violation: Violation) {
        if self.seen.insert(violation.clone()) {
            self.ordered.push(violation);
        }
    }

    fn into_result(self) -> ValidationResult {
        if self.ordered.is_empty() {
            ValidationResult::Accepted
        } else {
            ValidationResult::Rejected {
                reasons: self.ordered.iter().map(ToString::to_string).collect(),
            }
        }
    }
}

/// Source code that passed validation.
///
/// Only [`Validator::admit`] constructs it, so the execution engine cannot
/// be handed code that skipped the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedCode {
    code: SourceFragments,
    digest: String,
}

impl AcceptedCode {
    pub fn fragments(&self) -> &SourceFragments {
        &self.code
    }

    /// SHA-256 of the accepted fragments.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Static analyzer deciding whether a submission may run.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    policy: ValidatorPolicy,
}

impl Validator {
    pub fn new(policy: ValidatorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidatorPolicy {
        &self.policy
    }

    pub fn validate(&self, code: &SourceFragments) -> ValidationResult {
        let mut findings = Findings::default();
        for (fragment, source) in code.iter() {
            self.check_fragment(fragment, source, &mut findings);
        }
        findings.into_result()
    }

    /// Validate the code of a whole request; the input is not inspected.
    pub fn validate_submission(&self, submission: &CodeSubmission) -> ValidationResult {
        self.validate(&submission.code)
    }

    /// Validate three loose fragments.
    pub fn validate_fragments(
        &self,
        tokenizer_code: &str,
        model_code: &str,
        function_code: &str,
    ) -> ValidationResult {
        self.validate(&SourceFragments::new(
            tokenizer_code,
            model_code,
            function_code,
        ))
    }

    /// Validate and, on success, wrap the code as [`AcceptedCode`].
    ///
    /// On rejection the full reason list is returned.
    pub fn admit(&self, code: &SourceFragments) -> Result<AcceptedCode, Vec<String>> {
        match self.validate(code) {
            ValidationResult::Accepted => Ok(AcceptedCode {
                code: code.clone(),
                digest: code.digest(),
            }),
            ValidationResult::Rejected { reasons } => Err(reasons),
        }
    }

    fn check_fragment(&self, fragment: Fragment, source: &str, findings: &mut Findings) {
        let suite = match <ast::Suite as Parse>::parse(source, fragment.as_str()) {
            Ok(suite) => suite,
            Err(err) => {
                findings.push(Violation::Syntax {
                    fragment,
                    detail: err.to_string(),
                });
                return;
            }
        };

        if fragment == Fragment::Function {
            if let Some(violation) = check_entry_point(&suite) {
                findings.push(violation);
            }
        }

        let mut walker = Walker {
            policy: &self.policy,
            findings,
        };
        for stmt in suite {
            walker.visit_stmt(stmt);
        }
    }
}

/// Look for a top-level `def custom_function(<one positional>)`.
///
/// The last definition wins, as it does at runtime.
fn check_entry_point(suite: &[ast::Stmt]) -> Option<Violation> {
    for stmt in suite.iter().rev() {
        match stmt {
            ast::Stmt::FunctionDef(def) if def.name.as_str() == ENTRY_POINT => {
                return entry_point_arity(&def.args);
            }
            ast::Stmt::AsyncFunctionDef(def) if def.name.as_str() == ENTRY_POINT => {
                return Some(Violation::AsyncEntryPoint);
            }
            _ => {}
        }
    }
    Some(Violation::MissingEntryPoint)
}

fn entry_point_arity(args: &ast::Arguments) -> Option<Violation> {
    let positional = args.posonlyargs.len() + args.args.len();
    let required = args
        .posonlyargs
        .iter()
        .chain(args.args.iter())
        .filter(|arg| arg.default.is_none())
        .count();
    let required_kwonly = args
        .kwonlyargs
        .iter()
        .filter(|arg| arg.default.is_none())
        .count();

    let takes_one = positional >= 1 || args.vararg.is_some();
    if takes_one && required <= 1 && required_kwonly == 0 {
        None
    } else {
        Some(Violation::EntryPointArity(required.max(positional) + required_kwonly))
    }
}

/// Target name of a call, split by how it is reached.
enum CallTarget<'a> {
    Builtin(&'a str),
    Method(&'a str),
    Other,
}

fn call_target(func: &ast::Expr) -> CallTarget<'_> {
    match func {
        ast::Expr::Name(name) => CallTarget::Builtin(name.id.as_str()),
        ast::Expr::Attribute(attr) => CallTarget::Method(attr.attr.as_str()),
        _ => CallTarget::Other,
    }
}

struct Walker<'a> {
    policy: &'a ValidatorPolicy,
    findings: &'a mut Findings,
}

impl Walker<'_> {
    fn check_import(&mut self, module: &str) {
        if !self.policy.allows_import(module) {
            self.findings.push(Violation::Import(module.to_string()));
        }
    }
}

impl Visitor for Walker<'_> {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in &node.names {
            self.check_import(alias.name.as_str());
        }
        self.generic_visit_stmt_import(node);
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        match &node.module {
            Some(module) => {
                self.check_import(module.as_str());
                // `from random import _os` reads an attribute of the module.
                for alias in &node.names {
                    let name = alias.name.as_str();
                    if name != "*" && self.policy.denies_attribute_access(name) {
                        self.findings
                            .push(Violation::Import(format!("{}.{}", module.as_str(), name)));
                    }
                }
            }
            // `from . import x` has no module to check against the allow-list.
            None => self.findings.push(Violation::Import(".".to_string())),
        }
        self.generic_visit_stmt_import_from(node);
    }

    fn visit_expr_call(&mut self, node: ast::ExprCall) {
        let bare_name = match call_target(&node.func) {
            CallTarget::Builtin(name) => {
                if self.policy.denies_call(name) {
                    self.findings.push(Violation::Call(name.to_string()));
                }
                true
            }
            CallTarget::Method(name) => {
                if self.policy.denies_method(name) {
                    self.findings.push(Violation::Call(name.to_string()));
                }
                false
            }
            CallTarget::Other => false,
        };

        // A denied builtin is already reported as a call; skip its name.
        if !bare_name {
            self.visit_expr(*node.func);
        }
        for arg in node.args {
            self.visit_expr(arg);
        }
        for keyword in node.keywords {
            self.visit_keyword(keyword);
        }
    }

    // Product nodes have empty default walks; descend into their expressions.

    fn visit_keyword(&mut self, node: ast::Keyword) {
        self.visit_expr(node.value);
    }

    fn visit_arguments(&mut self, node: ast::Arguments) {
        let ast::Arguments {
            posonlyargs,
            args,
            vararg,
            kwonlyargs,
            kwarg,
            ..
        } = node;
        for arg in posonlyargs.into_iter().chain(args).chain(kwonlyargs) {
            if let Some(default) = arg.default {
                self.visit_expr(*default);
            }
            if let Some(annotation) = arg.def.annotation {
                self.visit_expr(*annotation);
            }
        }
        for arg in vararg.into_iter().chain(kwarg) {
            if let Some(annotation) = arg.annotation {
                self.visit_expr(*annotation);
            }
        }
    }

    fn visit_withitem(&mut self, node: ast::WithItem) {
        self.visit_expr(node.context_expr);
        if let Some(vars) = node.optional_vars {
            self.visit_expr(*vars);
        }
    }

    fn visit_comprehension(&mut self, node: ast::Comprehension) {
        self.visit_expr(node.target);
        self.visit_expr(node.iter);
        for condition in node.ifs {
            self.visit_expr(condition);
        }
    }

    fn visit_match_case(&mut self, node: ast::MatchCase) {
        self.visit_pattern(node.pattern);
        if let Some(guard) = node.guard {
            self.visit_expr(*guard);
        }
        for stmt in node.body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_expr_name(&mut self, node: ast::ExprName) {
        if matches!(node.ctx, ast::ExprContext::Load) && self.policy.denies_name(node.id.as_str())
        {
            self.findings.push(Violation::Name(node.id.as_str().to_string()));
        }
    }

    fn visit_expr_attribute(&mut self, node: ast::ExprAttribute) {
        if self.policy.denies_attribute_access(node.attr.as_str()) {
            self.findings
                .push(Violation::Attribute(node.attr.as_str().to_string()));
        }
        self.generic_visit_expr_attribute(node);
    }
}
