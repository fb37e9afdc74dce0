//! Infers `RecentEntity` updates from a successful tool call's arguments
//! (spec §3: "Created by the Agent upon successful tool execution whose
//! arguments contain a recognizable path/URL").

use agentry_core::{EntityAction, EntityKind, RecentEntity, ToolCall, ToolResult, Timestamp};
use serde_json::Value;

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// Recognizes a handful of common shell verbs so the loop's two-step
/// "create folder X then delete it" scenario (spec §8 scenario 2)
/// produces a sensible entity trail without a full shell parser.
fn infer_from_shell_command(command: &str) -> Option<(EntityAction, EntityKind, String)> {
    let trimmed = command.trim();
    let mut parts = trimmed.split_whitespace();
    let verb = parts.next()?;
    let rest: Vec<&str> = parts.filter(|p| !p.starts_with('-')).collect();
    let target = rest.last()?.to_string();

    match verb {
        "mkdir" => Some((EntityAction::Create, EntityKind::Folder, target)),
        "rmdir" => Some((EntityAction::Delete, EntityKind::Folder, target)),
        "rm" => Some((EntityAction::Delete, EntityKind::File, target)),
        "touch" => Some((EntityAction::Create, EntityKind::File, target)),
        "cp" => Some((EntityAction::Copy, EntityKind::File, target)),
        "mv" => Some((EntityAction::Move, EntityKind::File, target)),
        _ => None,
    }
}

/// Produce a `RecentEntity` for one successfully-executed tool call, if
/// its arguments name a recognizable file/folder/URL.
pub fn infer_entity(call: &ToolCall, result: &ToolResult) -> Option<RecentEntity> {
    if !result.success {
        return None;
    }

    let (action, kind, name) = match call.name.as_str() {
        "read_file" => (EntityAction::Open, EntityKind::File, str_arg(&call.arguments, "path")?.to_string()),
        "web_fetch" => (EntityAction::Open, EntityKind::Url, str_arg(&call.arguments, "url")?.to_string()),
        "shell" => {
            let command = str_arg(&call.arguments, "command")?;
            infer_from_shell_command(command)?
        }
        _ => return None,
    };

    Some(RecentEntity {
        kind,
        name: name.clone(),
        action,
        location: name,
        timestamp: Timestamp::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall { id: "c1".into(), name: name.into(), arguments: args }
    }

    #[test]
    fn mkdir_then_rmdir_produce_create_then_delete_on_the_same_name() {
        let mkdir_call = call("shell", json!({"command": "mkdir X"}));
        let result = ToolResult::ok("c1", "ok", 1);
        let entity = infer_entity(&mkdir_call, &result).unwrap();
        assert_eq!(entity.action, EntityAction::Create);
        assert_eq!(entity.name, "X");

        let rmdir_call = call("shell", json!({"command": "rmdir X"}));
        let entity = infer_entity(&rmdir_call, &result).unwrap();
        assert_eq!(entity.action, EntityAction::Delete);
        assert_eq!(entity.name, "X");
    }

    #[test]
    fn failed_tool_call_produces_no_entity() {
        let shell_call = call("shell", json!({"command": "mkdir X"}));
        let failed = ToolResult::failed("c1", "boom", 1);
        assert!(infer_entity(&shell_call, &failed).is_none());
    }

    #[test]
    fn read_file_produces_an_open_entity() {
        let call = call("read_file", json!({"path": "/tmp/notes.txt"}));
        let result = ToolResult::ok("c1", "contents", 1);
        let entity = infer_entity(&call, &result).unwrap();
        assert_eq!(entity.kind, EntityKind::File);
        assert_eq!(entity.action, EntityAction::Open);
        assert_eq!(entity.name, "/tmp/notes.txt");
    }

    #[test]
    fn unrecognized_tool_produces_no_entity() {
        let call = call("calculator", json!({"expr": "1+1"}));
        let result = ToolResult::ok("c1", "2", 1);
        assert!(infer_entity(&call, &result).is_none());
    }
}
