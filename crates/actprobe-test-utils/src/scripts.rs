use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make script executable");
    }
    path
}

/// Shell fragment that sets `$id` from the request line in `$line`.
const EXTRACT_ID: &str = r#"id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')"#;

/// A target that answers `health`, `status` and `doctor`, and rejects
/// anything else with method-not-found.
pub fn smoke_target_script(dir: &Path) -> PathBuf {
    let body = format!(
        r#"echo "smoke target starting" >&2
while IFS= read -r line; do
  {EXTRACT_ID}
  case "$line" in
    *'"method":"health"'*|*'"method":"status"'*|*'"method":"doctor"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"status":"healthy","issues":[]}}}}\n' "$id" ;;
    *)
      printf '{{"jsonrpc":"2.0","id":%s,"error":{{"code":-32601,"message":"Method not found"}}}}\n' "$id" ;;
  esac
done
"#
    );
    write_script(dir, "smoke_target.sh", &body)
}

/// A stateless target that answers every workflow method successfully with
/// fixed handles.
pub fn workflow_target_script(dir: &Path) -> PathBuf {
    let body = format!(
        r#"while IFS= read -r line; do
  {EXTRACT_ID}
  case "$line" in
    *'"method":"action.register"'*) result='{{"action_trn":"trn:openact:test:action/github/get-user@v1"}}' ;;
    *'"method":"auth.pat"'*) result='{{"connection_trn":"trn:authflow:test:connection/github-user1"}}' ;;
    *'"method":"run"'*) result='{{"ok":true,"data":{{"execution_trn":"trn:openact:test:execution:1","status":"completed"}}}}' ;;
    *'"method":"execution.get"'*) result='{{"ok":true,"data":{{"execution":{{"execution_trn":"trn:openact:test:execution:1"}}}}}}' ;;
    *'"method":"execution.list"'*) result='{{"ok":true,"data":{{"executions":[{{"execution_trn":"trn:openact:test:execution:1"}}],"count":1}}}}' ;;
    *) result='{{"status":"healthy"}}' ;;
  esac
  printf '{{"jsonrpc":"2.0","id":%s,"result":%s}}\n' "$id" "$result"
done
"#
    );
    write_script(dir, "workflow_target.sh", &body)
}
