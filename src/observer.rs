//! Declarative event-emission wrapper. Grounds on the `emit_log` helper that
//! wraps a state mutation with "build an entry, then publish it" without
//! touching the caller's return value — reframed here as a composition
//! helper per the design note steering away from language-level decorators.

use std::future::Future;

use serde_json::Value;
use tracing::warn;

use crate::event_bus::{Event, EventBus};

/// Declarative description of what to emit for one wrapped call: the event
/// type plus pure extraction functions over the call's arguments (`Args`)
/// and its result (`&T`).
pub struct EventSpec<Args, T> {
    pub event_type: &'static str,
    pub user_id: fn(&Args) -> String,
    pub related_user_id: fn(&Args, &T) -> Option<String>,
    pub circle_id: fn(&Args, &T) -> Option<String>,
    pub metadata: fn(&Args, &T) -> Value,
    pub emit_on_error: bool,
}

/// Wraps `op` so that, once its result is known, one event is emitted
/// describing the call. Never alters the return value, never swallows the
/// operation's error, and never itself panics: extraction failures are
/// logged and simply drop the event.
pub async fn observe<Args, T, E, F, Fut>(bus: &EventBus, spec: &EventSpec<Args, Result<T, E>>, args: Args, op: F) -> Result<T, E>
where
    F: FnOnce(&Args) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = op(&args).await;

    let should_emit = match &result {
        Ok(_) => true,
        Err(_) => spec.emit_on_error,
    };

    if should_emit {
        let user_id = (spec.user_id)(&args);
        let related_user_id = (spec.related_user_id)(&args, &result);
        let circle_id = (spec.circle_id)(&args, &result);
        let metadata = (spec.metadata)(&args, &result);

        let mut event = Event::new(spec.event_type, user_id);
        if let Some(related) = related_user_id {
            event = event.with_related_user(related);
        }
        if let Some(circle) = circle_id {
            event = event.with_circle(circle);
        }
        match metadata {
            Value::Object(map) => {
                for (k, v) in map {
                    event = event.with_metadata(k, v);
                }
            }
            Value::Null => {}
            other => {
                warn!(?other, "observer metadata builder did not return an object, dropping event");
                return result;
            }
        }
        bus.emit(event);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{InMemoryStore, KvStore};
    use serde_json::json;
    use std::sync::Arc;

    struct CallArgs {
        user_id: String,
    }

    #[tokio::test]
    async fn wrapped_call_emits_without_altering_return_value() {
        let store = InMemoryStore::new();
        let store_dyn: Arc<dyn KvStore> = Arc::new(store.clone());
        let mut cfg = Config::from_env();
        cfg.batch_size = 1;
        cfg.batch_wait_ms = 10;
        let bus = crate::event_bus::EventBus::start(store_dyn, &cfg, true);

        let spec: EventSpec<CallArgs, Result<i32, String>> = EventSpec {
            event_type: "test.called",
            user_id: |a| a.user_id.clone(),
            related_user_id: |_, _| None,
            circle_id: |_, _| None,
            metadata: |_, result| json!({ "value": result.as_ref().ok() }),
            emit_on_error: false,
        };

        let result = observe(&bus, &spec, CallArgs { user_id: "u1".into() }, |_| async { Ok::<i32, String>(42) }).await;
        assert_eq!(result, Ok(42));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.stream_len("observer:events:all").await, 1);
    }

    #[tokio::test]
    async fn error_result_skips_emission_when_emit_on_error_is_false() {
        let store = InMemoryStore::new();
        let store_dyn: Arc<dyn KvStore> = Arc::new(store.clone());
        let mut cfg = Config::from_env();
        cfg.batch_size = 1;
        cfg.batch_wait_ms = 10;
        let bus = crate::event_bus::EventBus::start(store_dyn, &cfg, true);

        let spec: EventSpec<CallArgs, Result<i32, String>> = EventSpec {
            event_type: "test.called",
            user_id: |a| a.user_id.clone(),
            related_user_id: |_, _| None,
            circle_id: |_, _| None,
            metadata: |_, _| json!({}),
            emit_on_error: false,
        };

        let result = observe(&bus, &spec, CallArgs { user_id: "u1".into() }, |_| async { Err::<i32, String>("boom".into()) }).await;
        assert_eq!(result, Err("boom".to_string()));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.stream_len("observer:events:all").await, 0);
    }
}
