//! Build-argument scoping and substitution.
//!
//! Arguments are visible only where declared: pipeline-level `arg` lines
//! parameterize external base references, stage-level `arg` lines cover the
//! instructions after them. A `${NAME}` whose argument is undeclared at that
//! point is an error, never an empty string.

use crate::builder::executor::BuildError;
use crate::builder::parser::{BaseRef, Instruction, Pipeline, RunCommand, Stage};
use std::collections::HashMap;
use tracing::debug;

/// Active argument bindings for one substitution context.
///
/// A `None` value means the argument is declared but has no default and no
/// override; referencing it is a [`BuildError::MissingArgumentValue`].
#[derive(Debug, Clone, Default)]
pub struct ArgumentScope {
    values: HashMap<String, Option<String>>,
    // Resolved (name, value) pairs in declaration order; fingerprint input
    resolved: Vec<(String, String)>,
}

impl ArgumentScope {
    /// Scope for base-reference substitution: the pipeline-level declarations.
    pub fn pipeline(pipeline: &Pipeline, overrides: &HashMap<String, String>) -> Self {
        let mut scope = Self::default();
        for (name, default) in &pipeline.pipeline_args {
            scope.declare(name, default.clone(), overrides);
        }
        scope
    }

    fn declare(
        &mut self,
        name: &str,
        default: Option<String>,
        overrides: &HashMap<String, String>,
    ) {
        let value = overrides.get(name).cloned().or(default);
        if let Some(v) = &value {
            self.resolved.push((name.to_string(), v.clone()));
        }
        self.values.insert(name.to_string(), value);
    }

    /// Resolved (name, value) pairs in declaration order.
    pub fn resolved(&self) -> &[(String, String)] {
        &self.resolved
    }

    /// Substitute every well-formed `${NAME}` occurrence in `text`.
    fn substitute(&self, stage: &str, text: &str) -> Result<String, BuildError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| BuildError::UnresolvedArgument {
                stage: stage.to_string(),
                name: after.to_string(),
            })?;
            let name = &after[..end];

            match self.values.get(name) {
                Some(Some(value)) => out.push_str(value),
                Some(None) => {
                    return Err(BuildError::MissingArgumentValue {
                        stage: stage.to_string(),
                        name: name.to_string(),
                    })
                }
                None => {
                    return Err(BuildError::UnresolvedArgument {
                        stage: stage.to_string(),
                        name: name.to_string(),
                    })
                }
            }

            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn substitute_command(
        &self,
        stage: &str,
        command: &RunCommand,
    ) -> Result<RunCommand, BuildError> {
        Ok(match command {
            RunCommand::Shell(s) => RunCommand::Shell(self.substitute(stage, s)?),
            RunCommand::Exec(args) => RunCommand::Exec(
                args.iter()
                    .map(|a| self.substitute(stage, a))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        })
    }
}

/// A stage with every `${NAME}` reference substituted.
#[derive(Debug, Clone)]
pub struct ResolvedStage {
    /// Instructions after substitution, declaration order preserved
    pub instructions: Vec<Instruction>,
    /// Resolved argument values in declaration order
    pub args: Vec<(String, String)>,
}

/// Substitute pipeline-level arguments into an external base reference.
///
/// Stage references stay literal; the dependency graph must be static.
pub fn resolve_base_ref(
    pipeline_scope: &ArgumentScope,
    stage: &Stage,
) -> Result<BaseRef, BuildError> {
    match &stage.base {
        BaseRef::External { name, tag, digest } => Ok(BaseRef::External {
            name: pipeline_scope.substitute(&stage.name, name)?,
            tag: tag
                .as_deref()
                .map(|t| pipeline_scope.substitute(&stage.name, t))
                .transpose()?,
            digest: digest
                .as_deref()
                .map(|d| pipeline_scope.substitute(&stage.name, d))
                .transpose()?,
        }),
        other => Ok(other.clone()),
    }
}

/// Resolve one stage's instructions against its declared arguments.
///
/// Walks instructions in order, extending the scope at each `arg`
/// declaration, so a reference ahead of its declaration fails. A stage
/// redeclaration without a default falls back to the pipeline-level default
/// for the same name.
pub fn resolve_stage(
    stage: &Stage,
    pipeline: &Pipeline,
    overrides: &HashMap<String, String>,
) -> Result<ResolvedStage, BuildError> {
    let mut scope = ArgumentScope::default();
    let mut instructions = Vec::with_capacity(stage.instructions.len());

    for inst in &stage.instructions {
        let resolved = match inst {
            Instruction::Arg { name, default } => {
                let default = default.clone().or_else(|| {
                    pipeline
                        .pipeline_arg_default(name)
                        .and_then(|d| d.clone())
                });
                scope.declare(name, default.clone(), overrides);
                Instruction::Arg {
                    name: name.clone(),
                    default,
                }
            }
            Instruction::Run { command } => Instruction::Run {
                command: scope.substitute_command(&stage.name, command)?,
            },
            Instruction::CopyFrom {
                source_stage,
                sources,
                destination,
                owner,
            } => Instruction::CopyFrom {
                source_stage: source_stage.clone(),
                sources: sources
                    .iter()
                    .map(|s| scope.substitute(&stage.name, s))
                    .collect::<Result<Vec<_>, _>>()?,
                destination: scope.substitute(&stage.name, destination)?,
                owner: owner
                    .as_deref()
                    .map(|o| scope.substitute(&stage.name, o))
                    .transpose()?,
            },
            Instruction::Env { vars } => Instruction::Env {
                vars: vars
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), scope.substitute(&stage.name, v)?)))
                    .collect::<Result<Vec<_>, BuildError>>()?,
            },
            Instruction::Workdir { path } => Instruction::Workdir {
                path: scope.substitute(&stage.name, path)?,
            },
            Instruction::Entrypoint { command } => Instruction::Entrypoint {
                command: scope.substitute_command(&stage.name, command)?,
            },
            Instruction::Cmd { command } => Instruction::Cmd {
                command: scope.substitute_command(&stage.name, command)?,
            },
            Instruction::Label { labels } => Instruction::Label {
                labels: labels
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), scope.substitute(&stage.name, v)?)))
                    .collect::<Result<Vec<_>, BuildError>>()?,
            },
        };
        instructions.push(resolved);
    }

    debug!(
        stage = %stage.name,
        args = scope.resolved().len(),
        "resolved stage arguments"
    );

    Ok(ResolvedStage {
        instructions,
        args: scope.resolved.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::parser::parse_pipeline;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitutes_declared_default() {
        let pipeline = parse_pipeline(
            r#"
stage s from scratch
arg JOBS = 4
run make -j${JOBS}
            "#,
        )
        .unwrap();

        let resolved = resolve_stage(&pipeline.stages[0], &pipeline, &HashMap::new()).unwrap();
        match &resolved.instructions[1] {
            Instruction::Run {
                command: RunCommand::Shell(cmd),
            } => assert_eq!(cmd, "make -j4"),
            other => panic!("Expected run, got {:?}", other),
        }
        assert_eq!(resolved.args, vec![("JOBS".to_string(), "4".to_string())]);
    }

    #[test]
    fn test_override_beats_default() {
        let pipeline = parse_pipeline(
            r#"
stage s from scratch
arg JOBS = 4
run make -j${JOBS}
            "#,
        )
        .unwrap();

        let resolved =
            resolve_stage(&pipeline.stages[0], &pipeline, &overrides(&[("JOBS", "16")])).unwrap();
        match &resolved.instructions[1] {
            Instruction::Run {
                command: RunCommand::Shell(cmd),
            } => assert_eq!(cmd, "make -j16"),
            other => panic!("Expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_reference_before_declaration_fails() {
        let pipeline = parse_pipeline(
            r#"
stage s from scratch
run echo ${LATE}
arg LATE = too late
            "#,
        )
        .unwrap();

        match resolve_stage(&pipeline.stages[0], &pipeline, &HashMap::new()) {
            Err(BuildError::UnresolvedArgument { stage, name }) => {
                assert_eq!(stage, "s");
                assert_eq!(name, "LATE");
            }
            other => panic!("Expected UnresolvedArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_declared_without_value_fails_when_referenced() {
        let pipeline = parse_pipeline(
            r#"
stage s from scratch
arg VERSION
run echo ${VERSION}
            "#,
        )
        .unwrap();

        assert!(matches!(
            resolve_stage(&pipeline.stages[0], &pipeline, &HashMap::new()),
            Err(BuildError::MissingArgumentValue { .. })
        ));

        // An override satisfies the declaration
        let resolved =
            resolve_stage(&pipeline.stages[0], &pipeline, &overrides(&[("VERSION", "9")]))
                .unwrap();
        assert_eq!(resolved.args, vec![("VERSION".to_string(), "9".to_string())]);
    }

    #[test]
    fn test_unreferenced_valueless_arg_is_fine() {
        let pipeline = parse_pipeline(
            r#"
stage s from scratch
arg OPTIONAL
run echo ok
            "#,
        )
        .unwrap();

        let resolved = resolve_stage(&pipeline.stages[0], &pipeline, &HashMap::new()).unwrap();
        assert!(resolved.args.is_empty());
    }

    #[test]
    fn test_pipeline_default_fallback_on_redeclaration() {
        let pipeline = parse_pipeline(
            r#"
arg LLVM_VERSION = 17.0.6

stage s from scratch
arg LLVM_VERSION
run echo ${LLVM_VERSION}
            "#,
        )
        .unwrap();

        let resolved = resolve_stage(&pipeline.stages[0], &pipeline, &HashMap::new()).unwrap();
        match &resolved.instructions[1] {
            Instruction::Run {
                command: RunCommand::Shell(cmd),
            } => assert_eq!(cmd, "echo 17.0.6"),
            other => panic!("Expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_pipeline_args_do_not_leak_into_stages() {
        let pipeline = parse_pipeline(
            r#"
arg GLOBAL = yes

stage s from scratch
run echo ${GLOBAL}
            "#,
        )
        .unwrap();

        // Visible only after an explicit stage-level redeclaration
        assert!(matches!(
            resolve_stage(&pipeline.stages[0], &pipeline, &HashMap::new()),
            Err(BuildError::UnresolvedArgument { .. })
        ));
    }

    #[test]
    fn test_base_ref_substitution() {
        let pipeline = parse_pipeline(
            r#"
arg DEBIAN = 12

stage s from ext:debian:${DEBIAN}
run echo hi
            "#,
        )
        .unwrap();

        let scope = ArgumentScope::pipeline(&pipeline, &HashMap::new());
        let base = resolve_base_ref(&scope, &pipeline.stages[0]).unwrap();
        assert_eq!(base.canonical(), "ext:debian:12");
    }

    #[test]
    fn test_exec_form_substitution() {
        let pipeline = parse_pipeline(
            r#"
stage s from scratch
arg BIN = /bin/app
entrypoint ["${BIN}", "--serve"]
            "#,
        )
        .unwrap();

        let resolved = resolve_stage(&pipeline.stages[0], &pipeline, &HashMap::new()).unwrap();
        match &resolved.instructions[1] {
            Instruction::Entrypoint {
                command: RunCommand::Exec(args),
            } => assert_eq!(args[0], "/bin/app"),
            other => panic!("Expected entrypoint, got {:?}", other),
        }
    }
}
