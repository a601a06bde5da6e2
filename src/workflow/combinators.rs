//! Step Combinators
//!
//! Wrappers that change when or on what part of the state a step runs,
//! and composites that run several steps as one.

use std::sync::Arc;

use uuid::Uuid;

use super::schema::InputSchema;
use super::state::{FieldValue, Fields, StateEnvelope};
use super::step::{Step, StepContext, StepError, StepOutcome};

/// State key holding the token an external system must present when it
/// calls back into a [`callback`] step.
pub const CALLBACK_TOKEN_KEY: &str = "callback_token";

fn group_progress_key(name: &str) -> String {
    format!("__group:{}", name)
}

/// Runs `step` only when `predicate` holds for the incoming state;
/// otherwise the step is recorded as skipped and the state passes through.
///
/// ```
/// use procflow::workflow::{conditional, Step};
///
/// let notify = conditional(
///     |state| state.get_bool("notify_customer") == Some(true),
///     Step::action("Notify customer", |_, s| Ok(s.clone().with("notified", true))),
/// );
/// assert_eq!(notify.name(), "Notify customer");
/// ```
pub fn conditional<P>(predicate: P, step: Step) -> Step
where
    P: Fn(&StateEnvelope) -> bool + Send + Sync + 'static,
{
    let inner = step.func();
    step.with_func(move |ctx, state| {
        if predicate(state) {
            inner(ctx, state)
        } else {
            StepOutcome::Skipped(state.clone())
        }
    })
}

/// Runs `step` against the nested record stored under `key` and writes
/// the resulting record back under the same key.
///
/// A missing key is treated as an empty record. Failures pass through
/// unchanged; a suspension keeps the outer state with the updated record.
pub fn focus(key: impl Into<String>, step: Step) -> Step {
    let key = key.into();
    let inner = step.func();
    step.with_func(move |ctx, state| {
        let nested = state
            .get(&key)
            .and_then(FieldValue::as_record)
            .cloned()
            .unwrap_or_default();
        let sub_state = StateEnvelope::from_fields(state.schema_version(), nested);

        let write_back = |sub: StateEnvelope| -> StateEnvelope {
            let record: Fields = sub.into_fields();
            state.clone().with(key.clone(), FieldValue::Record(record))
        };

        match inner(ctx, &sub_state) {
            StepOutcome::Success(sub) => StepOutcome::Success(write_back(sub)),
            StepOutcome::Skipped(sub) => StepOutcome::Skipped(write_back(sub)),
            StepOutcome::Suspend {
                state: sub,
                schema,
                wait,
            } => StepOutcome::Suspend {
                state: write_back(sub),
                schema,
                wait,
            },
            failed => failed,
        }
    })
}

/// Runs `steps` in order as a single step named `name`.
///
/// The group succeeds with the state of its last sub-step. The first
/// failure fails the group. When a sub-step suspends, the group suspends
/// with it and records how far it got in the state; the resume invokes the
/// group again, which continues after the suspended sub-step.
///
/// A retryable failure retries the whole group from its last resume point,
/// so sub-steps must be idempotent like any other step.
///
/// ```
/// use procflow::workflow::{group, Step};
///
/// let provision = group(
///     "Provision port",
///     [
///         Step::action("Reserve VLAN", |_, s| Ok(s.clone().with("vlan", 120))),
///         Step::action("Configure port", |_, s| Ok(s.clone().with("configured", true))),
///     ],
/// );
/// assert_eq!(provision.name(), "Provision port");
/// ```
pub fn group<I>(name: impl Into<String>, steps: I) -> Step
where
    I: IntoIterator<Item = Step>,
{
    let steps: Arc<Vec<Step>> = Arc::new(steps.into_iter().collect());
    let schema_version = steps
        .first()
        .map(Step::schema_version)
        .unwrap_or(super::step::DEFAULT_SCHEMA_VERSION);
    let name = name.into();
    let progress_key = group_progress_key(name.trim());

    Step::new(name, move |ctx, state| {
        let start = state
            .get_int(&progress_key)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        let mut current = state.clone();
        current.remove(&progress_key);

        for (offset, sub) in steps.iter().enumerate().skip(start) {
            if let Err(e) = sub.check_state(&current) {
                return StepOutcome::Fatal(StepError::new(e.to_string()));
            }
            let sub_ctx = StepContext {
                step: sub.name().to_string(),
                ..ctx.clone()
            };

            match sub.execute(&sub_ctx, &current) {
                StepOutcome::Success(next) | StepOutcome::Skipped(next) => current = next,
                StepOutcome::Suspend {
                    state: suspended,
                    schema,
                    wait,
                } => {
                    let resume_at = wait.continue_at(offset) as i64;
                    return StepOutcome::Suspend {
                        state: suspended.with(progress_key.clone(), resume_at),
                        schema,
                        wait: wait.reentering(),
                    };
                }
                failed => return failed,
            }
        }

        StepOutcome::Success(current)
    })
    .with_schema_version(schema_version)
}

/// Builds a step that hands work to an external system and waits for it to
/// call back.
///
/// The step is a [`group`] of five sub-steps:
/// 1. create a fresh token under [`CALLBACK_TOKEN_KEY`]
/// 2. `action`, which calls the external system and passes the token on
/// 3. wait for the call back, whose data must satisfy `payload`
/// 4. `validate`, which checks the data merged into the state
/// 5. drop the token
///
/// The external system answers through
/// [`Engine::callback`](crate::execution::Engine::callback).
pub fn callback(
    name: impl Into<String>,
    action: Step,
    payload: InputSchema,
    validate: Step,
) -> Step {
    let name = name.into();
    let name = name.trim();

    let create_token = Step::action(format!("{} - Create token", name), |_, s| {
        Ok(s.clone().with(CALLBACK_TOKEN_KEY, Uuid::new_v4().simple().to_string()))
    });
    let await_call = Step::new(format!("{} - Await callback", name), move |_, s| {
        StepOutcome::await_callback(s.clone(), payload.clone())
    });
    let cleanup = Step::action(format!("{} - Cleanup", name), |_, s| {
        let mut next = s.clone();
        next.remove(CALLBACK_TOKEN_KEY);
        Ok(next)
    });

    group(name, [create_token, action, await_call, validate, cleanup])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::process::{ProcessId, Wait, WaitKind};
    use crate::workflow::schema::FieldKind;

    fn ctx() -> StepContext {
        StepContext {
            process_id: ProcessId::new(),
            workflow: "wf".to_string(),
            step: "s".to_string(),
            index: 0,
            attempt: 1,
        }
    }

    fn mark() -> Step {
        Step::action("mark", |_, s| Ok(s.clone().with("marked", true)))
    }

    #[test]
    fn test_conditional_runs_when_true() {
        let step = conditional(|s| s.get_bool("go") == Some(true), mark());
        let state = StateEnvelope::new(1).with("go", true);

        match step.execute(&ctx(), &state) {
            StepOutcome::Success(next) => assert_eq!(next.get_bool("marked"), Some(true)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_conditional_skips_when_false() {
        let step = conditional(|s| s.get_bool("go") == Some(true), mark());
        let state = StateEnvelope::new(1).with("go", false);

        assert_eq!(step.execute(&ctx(), &state), StepOutcome::Skipped(state));
    }

    #[test]
    fn test_conditional_keeps_step_metadata() {
        let step = conditional(|_| true, mark().with_schema_version(3));
        assert_eq!(step.name(), "mark");
        assert_eq!(step.schema_version(), 3);
    }

    #[test]
    fn test_focus_updates_nested_record() {
        let step = focus("port", mark());
        let state = StateEnvelope::new(1)
            .with("node", "n1")
            .with(
                "port",
                FieldValue::Record(crate::workflow::state::fields([("id", 7.into())])),
            );

        let next = match step.execute(&ctx(), &state) {
            StepOutcome::Success(next) => next,
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert_eq!(next.get_str("node"), Some("n1"));
        let port = next.get("port").and_then(FieldValue::as_record).unwrap();
        assert_eq!(port["id"], FieldValue::Int(7));
        assert_eq!(port["marked"], FieldValue::Bool(true));
    }

    #[test]
    fn test_focus_missing_key_starts_empty() {
        let step = focus("settings", mark());
        let next = match step.execute(&ctx(), &StateEnvelope::new(1)) {
            StepOutcome::Success(next) => next,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let settings = next.get("settings").and_then(FieldValue::as_record).unwrap();
        assert_eq!(settings.len(), 1);
    }

    #[test]
    fn test_focus_passes_failures_through() {
        let failing = Step::action("fail", |_, _| Err(StepError::new("nope")));
        let step = focus("port", failing);

        assert_eq!(
            step.execute(&ctx(), &StateEnvelope::new(1)),
            StepOutcome::Fatal(StepError::new("nope"))
        );
    }

    #[test]
    fn test_group_runs_all_steps() {
        let step = group(
            "both",
            [
                Step::action("a", |_, s| Ok(s.clone().with("a", true))),
                Step::action("b", |_, s| Ok(s.clone().with("b", true))),
            ],
        );

        match step.execute(&ctx(), &StateEnvelope::new(1)) {
            StepOutcome::Success(next) => {
                assert_eq!(next.get_bool("a"), Some(true));
                assert_eq!(next.get_bool("b"), Some(true));
                assert!(!next.contains("__group:both"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_group_stops_at_first_failure() {
        let step = group(
            "g",
            [
                Step::action("fail", |_, _| Err("broken".into())),
                Step::action("never", |_, _| panic!("must not run")),
            ],
        );
        assert_eq!(
            step.execute(&ctx(), &StateEnvelope::new(1)),
            StepOutcome::Fatal(StepError::new("broken"))
        );
    }

    #[test]
    fn test_group_suspends_and_continues_after_sub_step() {
        let schema = InputSchema::new().required("ok", FieldKind::Bool);
        let step = group(
            "g",
            [
                Step::action("a", |_, s| Ok(s.clone().with("a", true))),
                Step::input("ask", schema.clone()),
                Step::action("b", |_, s| Ok(s.clone().with("b", s.get_bool("ok") == Some(true)))),
            ],
        );

        let suspended = match step.execute(&ctx(), &StateEnvelope::new(1)) {
            StepOutcome::Suspend {
                state,
                schema: asked,
                wait,
            } => {
                assert_eq!(asked, schema);
                assert_eq!(wait, Wait::input().reentering());
                state
            }
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(suspended.get_int("__group:g"), Some(2));

        let resumed = suspended.with("ok", true);
        match step.execute(&ctx(), &resumed) {
            StepOutcome::Success(next) => {
                assert_eq!(next.get_bool("b"), Some(true));
                assert!(!next.contains("__group:g"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_callback_waits_with_token() {
        let step = callback(
            "Order circuit",
            Step::action("call", |_, s| Ok(s.clone().with("ordered", true))),
            InputSchema::new().required("circuit_id", FieldKind::Text),
            Step::action("check", |_, s| Ok(s.clone())),
        );

        match step.execute(&ctx(), &StateEnvelope::new(1)) {
            StepOutcome::Suspend { state, wait, .. } => {
                assert_eq!(wait.kind, WaitKind::Callback);
                assert!(wait.reenter);
                assert_eq!(state.get_bool("ordered"), Some(true));
                assert!(state.get_str(CALLBACK_TOKEN_KEY).is_some());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
