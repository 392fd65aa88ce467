//! End-to-end engine runs over a native-environment store: the
//! calculator, the tool-using agent, reference variants, loop guards,
//! undeclared tools, and deadlines.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use tether_archive::PackageArchive;
use tether_core::{ErrorKind, InvokeRequest, ManifestOverrides, StepResult};
use tether_engine::{Engine, EngineOptions, RunState};
use tether_store::{ModuleProgram, ModuleStore, NativeEnvironmentProvider, NativeRuntime};

/// Left-to-right integer arithmetic over `+ - * /`, enough for a
/// calculator module.
fn eval_expr(expr: &str) -> Result<i64, String> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut value: i64 = tokens[0]
        .parse()
        .map_err(|_| format!("not a number: {}", tokens[0]))?;
    let mut rest = &tokens[1..];
    while rest.len() >= 2 {
        let rhs: i64 = rest[1]
            .parse()
            .map_err(|_| format!("not a number: {}", rest[1]))?;
        value = match rest[0] {
            "+" => value + rhs,
            "-" => value - rhs,
            "*" => value * rhs,
            "/" => {
                if rhs == 0 {
                    return Err("division by zero".to_string());
                }
                value / rhs
            }
            other => return Err(format!("unknown operator: {other}")),
        };
        rest = &rest[2..];
    }
    Ok(value)
}

fn calc_program() -> ModuleProgram {
    let mut program = ModuleProgram::new();
    program.register_step("calculate", |request: &InvokeRequest| {
        let expr = match &request.input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match eval_expr(&expr) {
            Ok(result) => StepResult::response(result.to_string()),
            Err(message) => StepResult::error(ErrorKind::Module, message),
        }
    });
    program.set_start_step("calculate");
    program
}

/// An agent with one calculator round trip: `agent_start` asks for the
/// tool, `agent_answer` consumes the observation. Input `"whoami"` short-
/// circuits to the `prompt` tunable, which is what the reference-variant
/// test observes.
fn agent_program() -> ModuleProgram {
    let mut program = ModuleProgram::new();
    program.register_step("agent_start", |request: &InvokeRequest| {
        if request.input == json!("whoami") {
            let prompt = request
                .tunables
                .get("prompt")
                .cloned()
                .unwrap_or(Value::Null);
            return StepResult::Response { content: prompt };
        }
        StepResult::ToolCall {
            tool: "ns/calc:0.1.0".to_string(),
            input: request.input.clone(),
            state: json!({ "query": request.input }),
            resume_step: Some("agent_answer".to_string()),
        }
    });
    program.register_step("agent_answer", |request: &InvokeRequest| {
        match &request.observation {
            Some(observation) => StepResult::response(format!("The answer is {observation}")),
            None => StepResult::error(ErrorKind::Module, "resumed without an observation"),
        }
    });
    program.set_start_step("agent_start");
    program
}

/// A module that calls its declared tool forever.
fn looping_program() -> ModuleProgram {
    let mut program = ModuleProgram::new();
    program.register_step("spin", |request: &InvokeRequest| StepResult::ToolCall {
        tool: "ns/calc:0.1.0".to_string(),
        input: json!("1 + 1"),
        state: request.input.clone(),
        resume_step: None,
    });
    program.set_start_step("spin");
    program
}

/// Pack and install a module from an inline manifest.
async fn install_module(store: &ModuleStore, manifest: &str) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("module.toml"), manifest).unwrap();
    std::fs::write(dir.path().join("main"), b"native").unwrap();
    let archive = PackageArchive::pack(dir.path()).unwrap();
    store.install(&archive).await.unwrap();
}

const CALC_MANIFEST: &str = r#"
["ns/calc@0.1.0"]
description = "Evaluates arithmetic expressions."
long_description = "Left-to-right integer arithmetic over + - * /."
"#;

const AGENT_MANIFEST: &str = r#"
["ns/agent@0.1.0"]
description = "Answers questions, using the calculator when needed."

["ns/agent@0.1.0".configurables]
tool_list = ["ns/calc:0.1.0"]

["ns/agent@0.1.0".tunables]
prompt = "base prompt"
"#;

struct Fixture {
    store: Arc<ModuleStore>,
    runtime: Arc<NativeRuntime>,
    _root: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let runtime = NativeRuntime::new();
    let provider = Arc::new(NativeEnvironmentProvider::new(Arc::clone(&runtime)));
    let store = Arc::new(ModuleStore::open(root.path(), provider).unwrap());

    install_module(&store, CALC_MANIFEST).await;
    install_module(&store, AGENT_MANIFEST).await;
    runtime.register("ns/calc", calc_program());
    runtime.register("ns/agent", agent_program());

    Fixture {
        store,
        runtime,
        _root: root,
    }
}

fn response_content(result: &StepResult) -> &Value {
    match result {
        StepResult::Response { content } => content,
        other => panic!("expected response, got {other:?}"),
    }
}

#[tokio::test]
async fn calc_answers_arithmetic() {
    let fx = fixture().await;
    let engine = Engine::new(Arc::clone(&fx.store));

    let outcome = engine.run("ns/calc", json!("2 + 2"), None).await.unwrap();
    assert_eq!(response_content(&outcome.result), &json!("4"));
    assert_eq!(outcome.trace.final_state, RunState::Completed);
    assert_eq!(outcome.trace.steps.len(), 1);
    assert_eq!(outcome.trace.steps[0].step, "calculate");

    // The trace artifact landed in the module's store location.
    let path = outcome.trace_path.expect("trace written");
    assert!(path.starts_with(fx.store.root()));
    assert!(path.to_string_lossy().contains("traces"));
}

#[tokio::test]
async fn agent_uses_calculator_once() {
    let fx = fixture().await;
    let engine = Engine::new(Arc::clone(&fx.store));

    let outcome = engine.run("ns/agent", json!("2 + 2"), None).await.unwrap();
    assert_eq!(
        response_content(&outcome.result),
        &json!("The answer is 4")
    );
    assert_eq!(outcome.trace.final_state, RunState::Completed);

    // Exactly one nested tool sub-trace, attached to the tool_call step.
    let sub_traces: Vec<_> = outcome
        .trace
        .steps
        .iter()
        .filter_map(|s| s.tool.as_ref())
        .collect();
    assert_eq!(sub_traces.len(), 1);
    assert_eq!(sub_traces[0].coordinate.to_string(), "ns/calc@0.1.0");
    assert_eq!(sub_traces[0].final_state, RunState::Completed);

    // Step sequence: tool_call then the resumed response.
    let actions: Vec<&str> = outcome
        .trace
        .steps
        .iter()
        .map(|s| s.action.as_str())
        .collect();
    assert_eq!(actions, vec!["tool_call", "response"]);
}

#[tokio::test]
async fn reference_variant_observes_overridden_tunable() {
    let fx = fixture().await;
    let engine = Engine::new(Arc::clone(&fx.store));

    let reference = "proj/agent-variant@0.1.0".parse().unwrap();
    let base = "ns/agent@0.1.0".parse().unwrap();
    let overrides = ManifestOverrides {
        tunables: [("prompt".to_string(), json!("variant prompt"))]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    fx.store
        .install_reference(&reference, &base, &overrides)
        .await
        .unwrap();

    // The variant runs the base's code and environment, but its step
    // observes the overridden tunable.
    let outcome = engine
        .run("proj/agent-variant", json!("whoami"), None)
        .await
        .unwrap();
    assert_eq!(response_content(&outcome.result), &json!("variant prompt"));

    // The base, run directly, still sees its own value.
    let outcome = engine.run("ns/agent", json!("whoami"), None).await.unwrap();
    assert_eq!(response_content(&outcome.result), &json!("base prompt"));
}

#[tokio::test]
async fn run_overrides_do_not_mutate_store() {
    let fx = fixture().await;
    let engine = Engine::new(Arc::clone(&fx.store));

    let overrides = ManifestOverrides {
        tunables: [("prompt".to_string(), json!("one run only"))]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    let outcome = engine
        .run("ns/agent", json!("whoami"), Some(&overrides))
        .await
        .unwrap();
    assert_eq!(response_content(&outcome.result), &json!("one run only"));

    let stored = fx.store.lookup("ns/agent").unwrap();
    assert_eq!(stored.manifest.tunables()["prompt"], json!("base prompt"));
}

#[tokio::test]
async fn tool_loop_limit_guard_fires() {
    let fx = fixture().await;
    install_module(
        &fx.store,
        concat!(
            "[\"ns/spinner@0.1.0\"]\n",
            "description = \"never terminates on its own\"\n\n",
            "[\"ns/spinner@0.1.0\".configurables]\n",
            "tool_list = [\"ns/calc:0.1.0\"]\n",
        ),
    )
    .await;
    fx.runtime.register("ns/spinner", looping_program());

    let engine = Engine::new(Arc::clone(&fx.store));
    let outcome = engine.run("ns/spinner", json!("go"), None).await.unwrap();
    match &outcome.result {
        StepResult::Error { kind, .. } => assert_eq!(*kind, ErrorKind::ToolLoopLimit),
        other => panic!("expected tool_loop_limit error, got {other:?}"),
    }
    assert_eq!(outcome.trace.final_state, RunState::Failed);
    // Five round trips were attempted before the guard fired.
    let tool_calls = outcome
        .trace
        .steps
        .iter()
        .filter(|s| s.action == "tool_call")
        .count();
    assert_eq!(tool_calls, 6);
}

#[tokio::test]
async fn undeclared_tool_is_rejected() {
    let fx = fixture().await;
    install_module(
        &fx.store,
        concat!(
            "[\"ns/rogue@0.1.0\"]\n",
            "description = \"calls a tool it never declared\"\n\n",
            "[\"ns/rogue@0.1.0\".configurables]\n",
            "tool_list = [\"ns/calc:0.1.0\"]\n",
        ),
    )
    .await;
    let mut rogue = ModuleProgram::new();
    rogue.register_step("start", |_request: &InvokeRequest| StepResult::ToolCall {
        tool: "ns/secret:1.0.0".to_string(),
        input: json!(null),
        state: json!(null),
        resume_step: None,
    });
    rogue.set_start_step("start");
    fx.runtime.register("ns/rogue", rogue);

    let engine = Engine::new(Arc::clone(&fx.store));
    let outcome = engine.run("ns/rogue", json!("x"), None).await.unwrap();
    match &outcome.result {
        StepResult::Error { kind, .. } => assert_eq!(*kind, ErrorKind::ToolNotDeclared),
        other => panic!("expected tool_not_declared error, got {other:?}"),
    }
}

#[tokio::test]
async fn declared_but_uninstalled_tool_warns_then_rejects() {
    let fx = fixture().await;
    install_module(
        &fx.store,
        concat!(
            "[\"ns/hopeful@0.1.0\"]\n",
            "description = \"declares a tool nobody installed\"\n\n",
            "[\"ns/hopeful@0.1.0\".configurables]\n",
            "tool_list = [\"ns/ghost:1.0.0\"]\n",
        ),
    )
    .await;
    let mut hopeful = ModuleProgram::new();
    hopeful.register_step("start", |request: &InvokeRequest| {
        // The unmatched tool is absent from the catalog the step sees.
        assert!(request.catalog.is_empty());
        StepResult::ToolCall {
            tool: "ns/ghost:1.0.0".to_string(),
            input: json!(null),
            state: json!(null),
            resume_step: None,
        }
    });
    hopeful.set_start_step("start");
    fx.runtime.register("ns/hopeful", hopeful);

    let engine = Engine::new(Arc::clone(&fx.store));
    let outcome = engine.run("ns/hopeful", json!("x"), None).await.unwrap();

    // The run proceeded up to the call, then failed — no crash.
    match &outcome.result {
        StepResult::Error { kind, .. } => assert_eq!(*kind, ErrorKind::ToolNotDeclared),
        other => panic!("expected tool_not_declared error, got {other:?}"),
    }
    assert!(
        outcome.trace.warnings.iter().any(|w| w.contains("ns/ghost")),
        "unmatched declared tool should be a trace warning: {:?}",
        outcome.trace.warnings
    );
}

#[tokio::test]
async fn catalog_carries_tool_descriptions() {
    let fx = fixture().await;
    install_module(
        &fx.store,
        concat!(
            "[\"ns/curious@0.1.0\"]\n",
            "description = \"inspects its catalog\"\n\n",
            "[\"ns/curious@0.1.0\".configurables]\n",
            "tool_list = [\"ns/calc:0.1.0\"]\n",
        ),
    )
    .await;
    let mut curious = ModuleProgram::new();
    curious.register_step("start", |request: &InvokeRequest| {
        let lines: Vec<String> = request
            .catalog
            .iter()
            .map(|t| format!("{}: {}", t.coordinate, t.description))
            .collect();
        StepResult::response(lines.join("\n"))
    });
    curious.set_start_step("start");
    fx.runtime.register("ns/curious", curious);

    let engine = Engine::new(Arc::clone(&fx.store));
    let outcome = engine.run("ns/curious", json!(null), None).await.unwrap();
    assert_eq!(
        response_content(&outcome.result),
        &json!("ns/calc@0.1.0: Evaluates arithmetic expressions.")
    );
}

#[tokio::test]
async fn top_level_timeout_fails_the_run() {
    let fx = fixture().await;
    install_module(
        &fx.store,
        "[\"ns/slow@0.1.0\"]\ndescription = \"stalls\"\n",
    )
    .await;
    let mut slow = ModuleProgram::new();
    slow.register_step("stall", |_request: &InvokeRequest| {
        std::thread::sleep(Duration::from_secs(2));
        StepResult::response("too late")
    });
    slow.set_start_step("stall");
    fx.runtime.register("ns/slow", slow);

    let engine = Engine::with_options(
        Arc::clone(&fx.store),
        EngineOptions {
            timeout: Duration::from_millis(150),
            ..Default::default()
        },
    );
    let outcome = engine.run("ns/slow", json!(null), None).await.unwrap();
    match &outcome.result {
        StepResult::Error { kind, .. } => assert_eq!(*kind, ErrorKind::Timeout),
        other => panic!("expected timeout error, got {other:?}"),
    }
    assert_eq!(outcome.trace.final_state, RunState::Failed);
}

#[tokio::test]
async fn tool_timeout_is_an_observation_not_a_parent_failure() {
    let fx = fixture().await;
    install_module(
        &fx.store,
        "[\"ns/slowtool@0.1.0\"]\ndescription = \"stalls\"\n",
    )
    .await;
    let mut slow = ModuleProgram::new();
    slow.register_step("stall", |_request: &InvokeRequest| {
        std::thread::sleep(Duration::from_secs(2));
        StepResult::response("too late")
    });
    slow.set_start_step("stall");
    fx.runtime.register("ns/slowtool", slow);

    install_module(
        &fx.store,
        concat!(
            "[\"ns/patient@0.1.0\"]\n",
            "description = \"reports what its tool did\"\n\n",
            "[\"ns/patient@0.1.0\".configurables]\n",
            "tool_list = [\"ns/slowtool:0.1.0\"]\n",
        ),
    )
    .await;
    let mut patient = ModuleProgram::new();
    patient.register_step("start", |request: &InvokeRequest| match &request.observation {
        None => StepResult::ToolCall {
            tool: "ns/slowtool:0.1.0".to_string(),
            input: json!(null),
            state: json!(null),
            resume_step: None,
        },
        Some(observation) => StepResult::response(format!("tool said: {observation}")),
    });
    patient.set_start_step("start");
    fx.runtime.register("ns/patient", patient);

    let engine = Engine::with_options(
        Arc::clone(&fx.store),
        EngineOptions {
            timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_millis(150),
            ..Default::default()
        },
    );
    let outcome = engine.run("ns/patient", json!(null), None).await.unwrap();

    // The parent completed; the tool's timeout arrived as an ordinary
    // error observation.
    assert_eq!(outcome.trace.final_state, RunState::Completed);
    match response_content(&outcome.result) {
        Value::String(s) => {
            assert!(s.starts_with("tool said: error(timeout)"), "got: {s}");
        }
        other => panic!("expected string response, got {other:?}"),
    }
}

#[tokio::test]
async fn run_of_missing_module_is_a_framework_error() {
    let fx = fixture().await;
    let engine = Engine::new(Arc::clone(&fx.store));
    assert!(engine.run("ns/nonexistent", json!(null), None).await.is_err());
}

#[tokio::test]
async fn calc_error_propagates_as_module_error() {
    let fx = fixture().await;
    let engine = Engine::new(Arc::clone(&fx.store));

    let outcome = engine
        .run("ns/calc", json!("2 / 0"), None)
        .await
        .unwrap();
    match &outcome.result {
        StepResult::Error { kind, message } => {
            assert_eq!(*kind, ErrorKind::Module);
            assert!(message.contains("division by zero"));
        }
        other => panic!("expected module error, got {other:?}"),
    }
    assert_eq!(outcome.trace.final_state, RunState::Failed);
}
