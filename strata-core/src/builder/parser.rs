//! Pipeline definition parser.
//!
//! Parses a `Stagefile` into a structured representation the build engine
//! can execute. Supports:
//! - Named stages over external, stage, or scratch bases
//! - Per-stage and pipeline-level build arguments
//! - Cross-stage copy directives (`copy-from ... to ...`)
//! - Line continuations and `#` comments

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Represents a complete parsed pipeline definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Build stages in declaration order
    pub stages: Vec<Stage>,
    /// Pipeline-level `arg` declarations (before the first stage)
    pub pipeline_args: Vec<(String, Option<String>)>,
}

impl Pipeline {
    /// Resolve a stage reference (name, alias, or positional index) to its index.
    pub fn stage_index(&self, reference: &str) -> Option<usize> {
        if let Ok(idx) = reference.parse::<usize>() {
            return if idx < self.stages.len() { Some(idx) } else { None };
        }
        self.stages.iter().position(|s| {
            s.name == reference || s.alias.as_deref() == Some(reference)
        })
    }

    /// The default build target: the last defined stage.
    pub fn last_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    /// Look up a pipeline-level argument default.
    pub fn pipeline_arg_default(&self, name: &str) -> Option<&Option<String>> {
        self.pipeline_args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }
}

/// A single build stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Stage name (required; `stage <name> from ...`)
    pub name: String,
    /// Optional alias (`... as <alias>`)
    pub alias: Option<String>,
    /// Base environment the stage starts from
    pub base: BaseRef,
    /// Instructions in declaration order
    pub instructions: Vec<Instruction>,
    /// Position in the pipeline (0-based)
    pub position: usize,
    /// Source line of the stage header
    pub line: usize,
}

impl Stage {
    /// Argument declarations in this stage, in declaration order.
    pub fn declared_args(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.instructions.iter().filter_map(|inst| match inst {
            Instruction::Arg { name, default } => Some((name.as_str(), default.as_deref())),
            _ => None,
        })
    }
}

/// Reference to a stage's base environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BaseRef {
    /// Externally provided environment (`ext:debian:12`, `ext:llvm@sha256:...`)
    External {
        name: String,
        tag: Option<String>,
        digest: Option<String>,
    },
    /// A previously defined stage's snapshot
    Stage(String),
    /// Empty base
    Scratch,
}

impl BaseRef {
    /// Canonical identity string; the fingerprint input for external bases.
    pub fn canonical(&self) -> String {
        match self {
            BaseRef::External { name, tag, digest } => {
                let mut s = format!("ext:{}", name);
                if let Some(tag) = tag {
                    s.push(':');
                    s.push_str(tag);
                }
                if let Some(digest) = digest {
                    s.push('@');
                    s.push_str(digest);
                }
                s
            }
            BaseRef::Stage(name) => name.clone(),
            BaseRef::Scratch => "scratch".to_string(),
        }
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A single pipeline instruction.
///
/// Env and label pairs keep declaration order; later pairs override
/// earlier ones with the same key when metadata is accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// run <command> or run ["exe", "arg"]
    Run { command: RunCommand },

    /// copy-from <stage-ref> <src>... to <dest> [owner=<spec>]
    CopyFrom {
        source_stage: String,
        sources: Vec<String>,
        destination: String,
        owner: Option<String>,
    },

    /// env KEY=value [...]
    Env { vars: Vec<(String, String)> },

    /// arg name[=default]
    Arg {
        name: String,
        default: Option<String>,
    },

    /// workdir /path
    Workdir { path: String },

    /// entrypoint ["exec", "form"] or entrypoint command
    Entrypoint { command: RunCommand },

    /// cmd ["exec", "form"] or cmd default args
    Cmd { command: RunCommand },

    /// label key=value [...]
    Label { labels: Vec<(String, String)> },
}

impl Instruction {
    /// Short keyword for diagnostics.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::Run { .. } => "run",
            Instruction::CopyFrom { .. } => "copy-from",
            Instruction::Env { .. } => "env",
            Instruction::Arg { .. } => "arg",
            Instruction::Workdir { .. } => "workdir",
            Instruction::Entrypoint { .. } => "entrypoint",
            Instruction::Cmd { .. } => "cmd",
            Instruction::Label { .. } => "label",
        }
    }
}

/// run/entrypoint/cmd command format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunCommand {
    /// Shell form: `run make -j8`
    Shell(String),
    /// Exec form: `run ["make", "-j8"]`
    Exec(Vec<String>),
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunCommand::Shell(s) => write!(f, "{}", s),
            RunCommand::Exec(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// Pipeline parse error.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("Line {line}: {message}")]
    Syntax {
        line: usize,
        message: String,
        hint: Option<String>,
    },

    #[error("Line {line}: duplicate stage name '{name}' (first defined on line {first_line})")]
    DuplicateName {
        name: String,
        line: usize,
        first_line: usize,
    },

    #[error("Line {line}: reference to unknown stage '{name}'")]
    UndefinedReference { name: String, line: usize },
}

impl ParseError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            line,
            message: message.into(),
            hint: None,
        }
    }

    fn syntax_hint(line: usize, message: impl Into<String>, hint: impl Into<String>) -> Self {
        ParseError::Syntax {
            line,
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    /// Hint text, when the error carries one.
    pub fn hint(&self) -> Option<&str> {
        match self {
            ParseError::Syntax { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

/// Parses a pipeline definition from a string.
///
/// # Arguments
/// * `content` - The pipeline definition text
///
/// # Returns
/// * `Ok(Pipeline)` - Successfully parsed pipeline
/// * `Err(ParseError)` - Parse error with line number and message
///
/// # Examples
/// ```
/// use strata_core::builder::parser::parse_pipeline;
///
/// let text = r#"
/// stage build from ext:debian:12
/// run make all
///
/// stage runtime from scratch
/// copy-from build /out/app to /bin/app
/// entrypoint ["/bin/app"]
/// "#;
///
/// let pipeline = parse_pipeline(text).unwrap();
/// assert_eq!(pipeline.stages.len(), 2);
/// ```
pub fn parse_pipeline(content: &str) -> Result<Pipeline, ParseError> {
    let mut parser = PipelineParser::new(content);
    parser.parse()
}

/// Parses a pipeline definition from a file.
pub fn parse_pipeline_file(path: &Path) -> Result<Pipeline, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| ParseError::Syntax {
        line: 0,
        message: format!("Failed to read pipeline definition: {}", e),
        hint: Some(format!("Check that {} exists and is readable", path.display())),
    })?;

    parse_pipeline(&content)
}

/// Internal parser state.
struct PipelineParser {
    lines: Vec<(usize, String)>, // (line_number, content)
    pos: usize,
    pipeline_args: Vec<(String, Option<String>)>,
    // (referenced stage, referencing line) pairs checked once all stages are known
    stage_refs: Vec<(String, usize)>,
}

impl PipelineParser {
    fn new(content: &str) -> Self {
        Self {
            lines: Self::preprocess(content),
            pos: 0,
            pipeline_args: Vec::new(),
            stage_refs: Vec::new(),
        }
    }

    /// Preprocess the definition: combine continuation lines, remove comments.
    fn preprocess(content: &str) -> Vec<(usize, String)> {
        let mut result = Vec::new();
        let mut current_line = String::new();
        let mut current_line_num = 0;
        let mut continuation = false;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-based line numbers

            // Remove comments (quote-blind, same as the rest of the grammar)
            let line = if let Some(pos) = line.find('#') {
                &line[..pos]
            } else {
                line
            };

            let trimmed = line.trim_end();

            if trimmed.is_empty() && !continuation {
                continue;
            }

            if continuation {
                current_line.push(' ');
                current_line.push_str(trimmed.trim_end_matches('\\').trim());
            } else {
                current_line_num = line_num;
                current_line = trimmed.trim_end_matches('\\').trim().to_string();
            }

            continuation = trimmed.ends_with('\\');

            if !continuation && !current_line.is_empty() {
                result.push((current_line_num, current_line.clone()));
                current_line.clear();
            }
        }

        if !current_line.is_empty() {
            result.push((current_line_num, current_line));
        }

        result
    }

    fn parse(&mut self) -> Result<Pipeline, ParseError> {
        // Pipeline-level args (before the first stage header)
        while !self.is_eof() {
            let (line_num, line) = (self.lines[self.pos].0, self.lines[self.pos].1.clone());
            let keyword = Self::extract_keyword(&line);

            if keyword == "arg" {
                let args = Self::extract_args(&line);
                let (name, default) = Self::parse_arg_pair(line_num, &args)?;
                self.pipeline_args.push((name, default));
                self.pos += 1;
            } else if keyword == "stage" {
                break;
            } else {
                return Err(ParseError::syntax_hint(
                    line_num,
                    format!("Expected 'arg' or 'stage', found '{}'", keyword),
                    "A pipeline must start with arg declarations or a stage header",
                ));
            }
        }

        let mut stages = Vec::new();
        while !self.is_eof() {
            let stage = self.parse_stage(stages.len())?;
            stages.push(stage);
        }

        if stages.is_empty() {
            return Err(ParseError::syntax(
                1,
                "Pipeline must contain at least one stage",
            ));
        }

        Self::check_duplicate_names(&stages)?;
        self.check_references(&stages)?;

        Ok(Pipeline {
            stages,
            pipeline_args: self.pipeline_args.clone(),
        })
    }

    fn parse_stage(&mut self, position: usize) -> Result<Stage, ParseError> {
        let (line_num, line) = (self.lines[self.pos].0, self.lines[self.pos].1.clone());
        let keyword = Self::extract_keyword(&line);

        if keyword != "stage" {
            return Err(ParseError::syntax_hint(
                line_num,
                format!("Expected 'stage', found '{}'", keyword),
                "Each stage must start with: stage <name> from <base-ref> [as <alias>]",
            ));
        }

        let (name, base, alias) = self.parse_stage_header(line_num, &line)?;
        self.pos += 1;

        let mut instructions = Vec::new();
        while !self.is_eof() {
            let (line_num, line) = (self.lines[self.pos].0, self.lines[self.pos].1.clone());
            let keyword = Self::extract_keyword(&line);

            // Next stage header ends this stage
            if keyword == "stage" {
                break;
            }

            let inst = self.parse_instruction(line_num, &line)?;
            instructions.push(inst);
            self.pos += 1;
        }

        Ok(Stage {
            name,
            alias,
            base,
            instructions,
            position,
            line: line_num,
        })
    }

    fn parse_stage_header(
        &mut self,
        line_num: usize,
        line: &str,
    ) -> Result<(String, BaseRef, Option<String>), ParseError> {
        // stage <name> from <base-ref> [as <alias>]
        let args = Self::extract_args(line);

        if args.len() < 3 || args[1] != "from" {
            return Err(ParseError::syntax_hint(
                line_num,
                "Malformed stage header".to_string(),
                "Usage: stage <name> from <base-ref> [as <alias>]",
            ));
        }

        let name = args[0].clone();
        Self::validate_stage_name(line_num, &name)?;

        let base = self.parse_base_ref(line_num, &args[2]);
        if let BaseRef::Stage(referenced) = &base {
            self.stage_refs.push((referenced.clone(), line_num));
        }

        let alias = match args.len() {
            3 => None,
            5 if args[3] == "as" => {
                let alias = args[4].clone();
                Self::validate_stage_name(line_num, &alias)?;
                Some(alias)
            }
            _ => {
                return Err(ParseError::syntax_hint(
                    line_num,
                    "Unexpected tokens after base reference".to_string(),
                    "Usage: stage <name> from <base-ref> [as <alias>]",
                ));
            }
        };

        Ok((name, base, alias))
    }

    fn validate_stage_name(line_num: usize, name: &str) -> Result<(), ParseError> {
        if name == "scratch" {
            return Err(ParseError::syntax_hint(
                line_num,
                "'scratch' is reserved and cannot name a stage".to_string(),
                "Pick another stage name",
            ));
        }
        if name.chars().all(|c| c.is_ascii_digit()) {
            return Err(ParseError::syntax_hint(
                line_num,
                format!("Stage name '{}' is all digits", name),
                "Numeric references are reserved for positional stage indexes",
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ParseError::syntax(
                line_num,
                format!("Invalid stage name '{}'", name),
            ));
        }
        Ok(())
    }

    fn parse_base_ref(&self, _line_num: usize, s: &str) -> BaseRef {
        if s == "scratch" {
            return BaseRef::Scratch;
        }

        if let Some(rest) = s.strip_prefix("ext:") {
            // Parse name[:tag][@digest]
            let (name_tag, digest) = if let Some(idx) = rest.find('@') {
                (&rest[..idx], Some(rest[idx + 1..].to_string()))
            } else {
                (rest, None)
            };

            let (name, tag) = if let Some(idx) = name_tag.rfind(':') {
                (&name_tag[..idx], Some(name_tag[idx + 1..].to_string()))
            } else {
                (name_tag, None)
            };

            return BaseRef::External {
                name: name.to_string(),
                tag,
                digest,
            };
        }

        // Anything else names a previously defined stage
        BaseRef::Stage(s.to_string())
    }

    fn parse_instruction(
        &mut self,
        line_num: usize,
        line: &str,
    ) -> Result<Instruction, ParseError> {
        let keyword = Self::extract_keyword(line);
        let args = Self::extract_args(line);

        match keyword.as_str() {
            "run" => self.parse_run(line_num, &args),
            "copy-from" => self.parse_copy_from(line_num, &args),
            "env" => self.parse_env(line_num, &args),
            "arg" => {
                let (name, default) = Self::parse_arg_pair(line_num, &args)?;
                Ok(Instruction::Arg { name, default })
            }
            "workdir" => self.parse_workdir(line_num, &args),
            "entrypoint" => self.parse_entrypoint(line_num, &args),
            "cmd" => self.parse_cmd(line_num, &args),
            "label" => self.parse_label(line_num, &args),
            _ => Err(ParseError::syntax(
                line_num,
                format!("Unknown instruction: {}", keyword),
            )),
        }
    }

    fn parse_run(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::syntax_hint(
                line_num,
                "run requires a command".to_string(),
                "Usage: run <command> or run [\"executable\", \"arg1\"]",
            ));
        }

        Ok(Instruction::Run {
            command: Self::parse_run_command(args),
        })
    }

    fn parse_run_command(args: &[String]) -> RunCommand {
        // Exec form is a JSON array
        if args[0].starts_with('[') {
            let json_str = args.join(" ");
            if let Ok(exec_args) = serde_json::from_str::<Vec<String>>(&json_str) {
                return RunCommand::Exec(exec_args);
            }
        }

        RunCommand::Shell(args.join(" "))
    }

    fn parse_copy_from(&mut self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // copy-from <stage-ref> <src>... to <dest> [owner=<spec>]
        if args.len() < 4 {
            return Err(ParseError::syntax_hint(
                line_num,
                "copy-from requires a source stage, source paths, and a destination".to_string(),
                "Usage: copy-from <stage-ref> <src-paths...> to <dest-path> [owner=<spec>]",
            ));
        }

        let source_stage = args[0].clone();
        self.stage_refs.push((source_stage.clone(), line_num));

        // Separator search starts past the stage-ref token.
        let to_pos = args[1..]
            .iter()
            .rposition(|a| a == "to")
            .map(|i| i + 1)
            .ok_or_else(|| {
                ParseError::syntax_hint(
                    line_num,
                    "copy-from is missing the 'to' separator".to_string(),
                    "Usage: copy-from <stage-ref> <src-paths...> to <dest-path> [owner=<spec>]",
                )
            })?;

        let sources: Vec<String> = args[1..to_pos].to_vec();
        if sources.is_empty() {
            return Err(ParseError::syntax(
                line_num,
                "copy-from requires at least one source path",
            ));
        }

        let mut rest = args[to_pos + 1..].iter();
        let destination = rest
            .next()
            .cloned()
            .ok_or_else(|| ParseError::syntax(line_num, "copy-from requires a destination path"))?;

        let mut owner = None;
        for extra in rest {
            if let Some(spec) = extra.strip_prefix("owner=") {
                owner = Some(spec.to_string());
            } else {
                return Err(ParseError::syntax(
                    line_num,
                    format!("Unexpected token after destination: {}", extra),
                ));
            }
        }

        Ok(Instruction::CopyFrom {
            source_stage,
            sources,
            destination,
            owner,
        })
    }

    fn parse_env(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::syntax(
                line_num,
                "env requires at least one KEY=value pair",
            ));
        }

        let mut vars = Vec::new();
        for arg in args {
            let idx = arg.find('=').ok_or_else(|| {
                ParseError::syntax_hint(
                    line_num,
                    format!("Malformed env pair: {}", arg),
                    "Usage: env KEY=value [KEY2=value2 ...]",
                )
            })?;
            let key = arg[..idx].to_string();
            let value = arg[idx + 1..].trim_matches('"').to_string();
            if key.is_empty() {
                return Err(ParseError::syntax(line_num, "env key must not be empty"));
            }
            vars.push((key, value));
        }

        Ok(Instruction::Env { vars })
    }

    fn parse_arg_pair(
        line_num: usize,
        args: &[String],
    ) -> Result<(String, Option<String>), ParseError> {
        if args.is_empty() {
            return Err(ParseError::syntax_hint(
                line_num,
                "arg requires a name".to_string(),
                "Usage: arg <name> [= <default>]",
            ));
        }

        // Accept both `arg NAME=default` and `arg NAME = default`
        if let Some(idx) = args[0].find('=') {
            let name = args[0][..idx].to_string();
            let mut default = args[0][idx + 1..].to_string();
            if !args[1..].is_empty() {
                if !default.is_empty() {
                    default.push(' ');
                }
                default.push_str(&args[1..].join(" "));
            }
            if name.is_empty() {
                return Err(ParseError::syntax(line_num, "arg name must not be empty"));
            }
            return Ok((name, Some(default.trim_matches('"').to_string())));
        }

        let name = args[0].clone();
        match args.get(1).map(String::as_str) {
            None => Ok((name, None)),
            Some("=") => {
                let default = args[2..].join(" ").trim_matches('"').to_string();
                Ok((name, Some(default)))
            }
            Some(other) => Err(ParseError::syntax_hint(
                line_num,
                format!("Unexpected token after arg name: {}", other),
                "Usage: arg <name> [= <default>]",
            )),
        }
    }

    fn parse_workdir(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::syntax(line_num, "workdir requires a path"));
        }
        Ok(Instruction::Workdir {
            path: args.join(" "),
        })
    }

    fn parse_entrypoint(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::syntax(line_num, "entrypoint requires a command"));
        }
        Ok(Instruction::Entrypoint {
            command: Self::parse_run_command(args),
        })
    }

    fn parse_cmd(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::syntax(line_num, "cmd requires arguments"));
        }
        Ok(Instruction::Cmd {
            command: Self::parse_run_command(args),
        })
    }

    fn parse_label(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::syntax(line_num, "label requires a key=value pair"));
        }

        let mut labels = Vec::new();
        for arg in args {
            let idx = arg.find('=').ok_or_else(|| {
                ParseError::syntax(line_num, format!("Malformed label pair: {}", arg))
            })?;
            let key = arg[..idx].to_string();
            let value = arg[idx + 1..].trim_matches('"').to_string();
            labels.push((key, value));
        }

        Ok(Instruction::Label { labels })
    }

    fn check_duplicate_names(stages: &[Stage]) -> Result<(), ParseError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for stage in stages {
            let mut names = vec![(stage.name.as_str(), stage.line)];
            if let Some(alias) = &stage.alias {
                names.push((alias.as_str(), stage.line));
            }
            for (name, line) in names {
                if let Some(&first_line) = seen.get(name) {
                    return Err(ParseError::DuplicateName {
                        name: name.to_string(),
                        line,
                        first_line,
                    });
                }
                seen.insert(name, line);
            }
        }
        Ok(())
    }

    /// Every stage reference must name a stage defined somewhere in the
    /// pipeline; ordering is enforced later by the graph builder.
    fn check_references(&self, stages: &[Stage]) -> Result<(), ParseError> {
        let known = |reference: &str| -> bool {
            if let Ok(idx) = reference.parse::<usize>() {
                return idx < stages.len();
            }
            stages
                .iter()
                .any(|s| s.name == reference || s.alias.as_deref() == Some(reference))
        };

        for (reference, line) in &self.stage_refs {
            if !known(reference) {
                return Err(ParseError::UndefinedReference {
                    name: reference.clone(),
                    line: *line,
                });
            }
        }
        Ok(())
    }

    fn extract_keyword(line: &str) -> String {
        line.split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase()
    }

    fn extract_args(line: &str) -> Vec<String> {
        let mut parts = line.splitn(2, char::is_whitespace);
        parts.next(); // Skip keyword

        if let Some(args_str) = parts.next() {
            Self::tokenize(args_str.trim())
        } else {
            Vec::new()
        }
    }

    /// Simple tokenizer that respects quotes and JSON arrays.
    fn tokenize(s: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_json = 0;

        for c in s.chars() {
            match c {
                '"' if in_json == 0 => {
                    in_quotes = !in_quotes;
                    current.push(c);
                }
                '[' if !in_quotes => {
                    in_json += 1;
                    current.push(c);
                }
                ']' if !in_quotes && in_json > 0 => {
                    in_json -= 1;
                    current.push(c);
                    if in_json == 0 {
                        tokens.push(current.clone());
                        current.clear();
                    }
                }
                ' ' | '\t' if !in_quotes && in_json == 0 => {
                    if !current.is_empty() {
                        tokens.push(current.clone());
                        current.clear();
                    }
                }
                _ => {
                    current.push(c);
                }
            }
        }

        if !current.is_empty() {
            tokens.push(current);
        }

        tokens
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.lines.len()
    }
}
