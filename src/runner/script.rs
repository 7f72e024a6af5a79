//! Runner script generation
//!
//! Every worker, regardless of backend, executes the same small bootstrap
//! program: load `input.json` and `args.json` from the working directory,
//! resolve the agent's entry point, invoke it under a task-tagged tracing
//! scope, and write `output.json` on success or `error.log` on failure.
//! The script is regenerated per task because `run_id` and `task_id` are
//! embedded as literals.

use crate::errors::HarnessError;
use crate::runner::AgentSpec;

/// Name the bootstrap program is saved under inside the workspace.
pub const SCRIPT_NAME: &str = "run_agent.py";

/// Generate the bootstrap program for one task.
///
/// # Errors
///
/// Fails only when the agent's entry spec is malformed.
pub fn generate(run_id: &str, task_id: &str, agent: &AgentSpec) -> Result<String, HarnessError> {
    let (module, function) = agent.entry_parts()?;

    Ok(format!(
        r#"import os
import json
import importlib.util
import traceback

import weave

try:
    weave.init("{run_id}")

    with open("input.json", "r") as f:
        input_data = json.load(f)

    with open("args.json", "r") as f:
        agent_args = json.load(f)

    spec = importlib.util.spec_from_file_location(
        "{module}",
        os.path.join(os.getcwd(), "{module}.py"),
    )
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    agent_fn = getattr(module, "{function}")

    with weave.attributes({{"weave_task_id": "{task_id}"}}):
        result = agent_fn(input_data, **agent_args)

    with open("output.json", "w") as f:
        json.dump(result, f)

except Exception as e:
    print(f"Error running agent: {{e}}")
    print(traceback.format_exc())
    with open("error.log", "w") as f:
        f.write(f"ERROR: {{e}}\n")
        f.write(traceback.format_exc())
    raise
"#,
        run_id = py_escape(run_id),
        task_id = py_escape(task_id),
        module = py_escape(module),
        function = py_escape(function),
    ))
}

/// Escape a value for embedding in a double-quoted Python string literal.
///
/// Run and task IDs are filename-safe by contract; this guards the few
/// characters that would still break the literal.
fn py_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ExecutionMode;
    use serde_json::Map;
    use std::path::PathBuf;

    fn agent(entry: &str) -> AgentSpec {
        AgentSpec {
            name: "tester".into(),
            entry: entry.into(),
            directory: PathBuf::from("."),
            args: Map::new(),
            execution_mode: ExecutionMode::Local,
            environment_name: None,
        }
    }

    #[test]
    fn test_generated_script_embeds_ids() {
        let script = generate("run-7", "task-3", &agent("my_agent.run")).unwrap();

        assert!(script.contains(r#"weave.init("run-7")"#));
        assert!(script.contains(r#"{"weave_task_id": "task-3"}"#));
        assert!(script.contains(r#""my_agent.py""#));
        assert!(script.contains(r#"getattr(module, "run")"#));
    }

    #[test]
    fn test_script_writes_output_and_error_files() {
        let script = generate("r", "t", &agent("a.main")).unwrap();
        assert!(script.contains(r#"open("output.json", "w")"#));
        assert!(script.contains(r#"open("error.log", "w")"#));
        // exits non-zero on failure
        assert!(script.trim_end().ends_with("raise"));
    }

    #[test]
    fn test_nested_module_entry() {
        let script = generate("r", "t", &agent("pkg.module.main")).unwrap();
        assert!(script.contains(r#""pkg.module.py""#));
        assert!(script.contains(r#"getattr(module, "main")"#));
    }

    #[test]
    fn test_invalid_entry_rejected() {
        assert!(generate("r", "t", &agent("nodot")).is_err());
    }

    #[test]
    fn test_escaping() {
        let script = generate(r#"run"quoted"#, "t", &agent("a.b")).unwrap();
        assert!(script.contains(r#"weave.init("run\"quoted")"#));
    }
}
