//! Pod manifests and the shell snippets run inside sandbox pods.

use serde_json::{Map, Value, json};

use crate::sandbox::local_host::fs_jail::guess_mime;
use crate::sandbox::types::{FilesystemEntry, KubernetesConfig, sort_entries};
use crate::storage::snapshot::{EXCLUDED_DIRS, EXCLUDED_SUFFIXES};

/// Where the agent config is written inside the pod, outside the workspace.
pub const AGENT_CONFIG_PATH: &str = "/tmp/agent/opencode.json";

/// Exit code of the file scripts for a missing path.
pub const PATH_NOT_FOUND_EXIT: i32 = 3;
/// Exit code of the file scripts when the path is the wrong kind: not a
/// directory for `LIST_SCRIPT`, a directory for the others.
pub const WRONG_KIND_EXIT: i32 = 4;
/// Exit code of `WRITE_NEW_SCRIPT` when the target already exists.
pub const FILE_EXISTS_EXIT: i32 = 18;
/// Exit code of `RESTORE_SCRIPT` when the workspace is not empty.
pub const RESTORE_CONFLICT_EXIT: i32 = 17;

const LABEL_MAX: usize = 63;

pub fn pod_name(sandbox_id: &str) -> String {
    let id: String = sandbox_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("sandbox-{}", id.trim_matches('-'))
}

/// Coerce an arbitrary string into a valid label value.
pub fn label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(LABEL_MAX)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

pub fn build_pod_manifest(
    config: &KubernetesConfig,
    name: &str,
    tenant_id: &str,
    user_id: &str,
    sandbox_id: &str,
) -> Value {
    let mut labels = Map::new();
    labels.insert("app.kubernetes.io/name".into(), json!("sandbox"));
    labels.insert("app.kubernetes.io/managed-by".into(), json!(env!("CARGO_PKG_NAME")));
    labels.insert("sandbox/id".into(), json!(label_value(sandbox_id)));
    labels.insert("sandbox/tenant".into(), json!(label_value(tenant_id)));
    labels.insert("sandbox/user".into(), json!(label_value(user_id)));

    let mut spec = json!({
        "restartPolicy": "Never",
        "automountServiceAccountToken": config.service_account.is_some(),
        "containers": [{
            "name": config.container_name,
            "image": config.image,
            "command": ["sleep", "infinity"],
            "workingDir": config.workspace_dir,
            "stdin": true,
            "volumeMounts": [{ "name": "workspace", "mountPath": config.workspace_dir }],
            "securityContext": {
                "allowPrivilegeEscalation": false,
                "capabilities": { "drop": ["ALL"] }
            }
        }],
        "volumes": [{ "name": "workspace", "emptyDir": {} }]
    });
    if let Some(sa) = &config.service_account {
        spec["serviceAccountName"] = json!(sa);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": config.namespace,
            "labels": Value::Object(labels),
        },
        "spec": spec,
    })
}

/// Lists `$1` one level deep as `kind<TAB>size<TAB>name` lines.
pub const LIST_SCRIPT: &str = r#"[ -e "$1" ] || exit 3
[ -d "$1" ] || exit 4
cd "$1" || exit 3
for f in * .[!.]* ..?*; do
  [ -e "$f" ] || continue
  if [ -d "$f" ]; then
    printf 'd\t0\t%s\n' "$f"
  else
    printf 'f\t%s\t%s\n' "$(wc -c < "$f" | tr -d ' ')" "$f"
  fi
done
"#;

/// Prints the regular file `$1`.
pub const READ_SCRIPT: &str = r#"[ -e "$1" ] || exit 3
[ -f "$1" ] || exit 4
exec cat "$1"
"#;

/// Creates `$1/$2` from stdin, refusing to replace an existing file.
pub const WRITE_NEW_SCRIPT: &str = r#"set -e
mkdir -p "$1"
[ ! -e "$1/$2" ] && [ ! -L "$1/$2" ] || exit 18
set -C
cat > "$1/$2"
chmod 644 "$1/$2"
"#;

/// Removes the file or symlink `$1`. Directories are refused.
pub const DELETE_SCRIPT: &str = r#"[ -e "$1" ] || [ -L "$1" ] || exit 3
if [ -d "$1" ] && [ ! -L "$1" ]; then exit 4; fi
rm -f "$1"
"#;

/// Parse `LIST_SCRIPT` output for the directory at workspace-relative `dir`.
pub fn parse_listing(output: &str, dir: &str) -> Vec<FilesystemEntry> {
    let mut entries: Vec<FilesystemEntry> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let kind = parts.next()?;
            let size = parts.next()?.trim().parse::<u64>().ok();
            let name = parts.next().filter(|n| !n.is_empty())?;
            let is_directory = match kind {
                "d" => true,
                "f" => false,
                _ => return None,
            };
            let path = if dir.is_empty() {
                name.to_string()
            } else {
                format!("{dir}/{name}")
            };
            Some(FilesystemEntry {
                name: name.to_string(),
                path,
                is_directory,
                size: if is_directory { None } else { size },
                mime_type: if is_directory { None } else { guess_mime(name) },
            })
        })
        .collect();
    sort_entries(&mut entries);
    entries
}

/// Writes a reproducible tar.gz of `$1` to stdout, skipping symlinks and
/// transient files. Every stage writes to a scratch file so a failing
/// `find` or `tar` exits non-zero before anything reaches stdout.
pub fn snapshot_script() -> String {
    let dirs = EXCLUDED_DIRS
        .iter()
        .map(|d| format!("-name '{d}'"))
        .collect::<Vec<_>>()
        .join(" -o ");
    let files = EXCLUDED_SUFFIXES
        .iter()
        .map(|s| format!("! -name '*{s}'"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "set -e\n\
         scratch=$(mktemp -d)\n\
         trap 'rm -rf \"$scratch\"' EXIT\n\
         cd \"$1\"\n\
         find . -mindepth 1 \\( -type d \\( {dirs} \\) -prune \\) -o \\( \\( -type f -o -type d \\) {files} -print \\) > \"$scratch/found\"\n\
         sed 's|^\\./||' \"$scratch/found\" > \"$scratch/names\"\n\
         LC_ALL=C sort -o \"$scratch/sorted\" \"$scratch/names\"\n\
         tar -cf \"$scratch/archive.tar\" --no-recursion --numeric-owner --owner=0 --group=0 --mtime=@0 --mode=go-w,a+rX -T \"$scratch/sorted\"\n\
         gzip -n -c < \"$scratch/archive.tar\"\n"
    )
}

/// Extracts a tar.gz from stdin into `$1`. `$2` is `1` to replace existing
/// contents; otherwise a non-empty `$1` exits with `RESTORE_CONFLICT_EXIT`.
/// The archive is unpacked to a staging dir first so a bad archive leaves
/// `$1` untouched.
pub const RESTORE_SCRIPT: &str = r#"set -e
if [ -n "$(ls -A "$1" 2>/dev/null)" ] && [ "$2" != 1 ]; then exit 17; fi
staging=$(mktemp -d)
trap 'rm -rf "$staging"' EXIT
tar -xzf - -C "$staging" --no-same-owner
mkdir -p "$1"
find "$1" -mindepth 1 -maxdepth 1 -exec rm -rf {} +
cp -a "$staging"/. "$1"/
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_names_are_dns_safe() {
        assert_eq!(
            pod_name("3F2504E0-4F89-11D3-9A0C-0305E82C3301"),
            "sandbox-3f2504e0-4f89-11d3-9a0c-0305e82c3301"
        );
        assert_eq!(pod_name("a_b"), "sandbox-a-b");
    }

    #[test]
    fn label_values_are_sanitized() {
        assert_eq!(label_value("alice@example.com"), "alice_example.com");
        assert_eq!(label_value("-x-"), "x");
        assert_eq!(label_value(&"a".repeat(100)).len(), 63);
    }

    #[test]
    fn manifest_shape() {
        let cfg = KubernetesConfig {
            service_account: Some("sandbox-runner".into()),
            ..KubernetesConfig::default()
        };
        let m = build_pod_manifest(&cfg, "sandbox-1", "acme", "alice", "1");
        assert_eq!(m["kind"], "Pod");
        assert_eq!(m["metadata"]["namespace"], "sandboxes");
        assert_eq!(m["metadata"]["labels"]["sandbox/tenant"], "acme");
        assert_eq!(m["spec"]["serviceAccountName"], "sandbox-runner");
        assert_eq!(m["spec"]["automountServiceAccountToken"], true);
        let container = &m["spec"]["containers"][0];
        assert_eq!(container["image"], "sandbox-agent:latest");
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/workspace");

        let plain = build_pod_manifest(&KubernetesConfig::default(), "p", "t", "u", "i");
        assert!(plain["spec"].get("serviceAccountName").is_none());
        assert_eq!(plain["spec"]["automountServiceAccountToken"], false);
    }

    #[test]
    fn listing_is_parsed_and_sorted() {
        let out = "f\t12\tREADME.md\nd\t0\tsrc\nf\t 7\tapp.py\ngarbage\nd\t0\t.git\n";
        let entries = parse_listing(out, "proj");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".git", "src", "app.py", "README.md"]);
        assert_eq!(entries[1].path, "proj/src");
        assert_eq!(entries[1].size, None);
        assert_eq!(entries[2].size, Some(7));
        assert!(entries[3].mime_type.is_some());
    }

    #[test]
    fn snapshot_script_excludes_transient_paths() {
        let script = snapshot_script();
        assert!(script.contains("-name '__pycache__'"));
        assert!(script.contains("! -name '*.lock'"));
        assert!(script.contains("gzip -n"));
        assert!(script.contains("--mtime=@0"));
        assert!(!script.contains("| tar"));
    }

    /// Runs the snapshot script on the host with `stubs` shadowing commands.
    #[cfg(unix)]
    fn run_snapshot_with_stubs(
        workspace: &std::path::Path,
        stubs: &[(&str, &str)],
    ) -> std::process::Output {
        use std::os::unix::fs::PermissionsExt;

        let bin = tempfile::tempdir().unwrap();
        for (name, body) in stubs {
            let path = bin.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let path = format!(
            "{}:{}",
            bin.path().display(),
            std::env::var("PATH").unwrap_or_default()
        );
        std::process::Command::new("sh")
            .arg("-c")
            .arg(snapshot_script())
            .arg("sh")
            .arg(workspace)
            .env("PATH", path)
            .output()
            .unwrap()
    }

    #[cfg(unix)]
    fn run_script(script: &str, args: &[&str], stdin: &[u8]) -> std::process::Output {
        use std::io::Write;

        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .arg("sh")
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        child.stdin.take().unwrap().write_all(stdin).unwrap();
        child.wait_with_output().unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn file_scripts_exit_codes() {
        let ws = tempfile::tempdir().unwrap();
        let root = ws.path().display().to_string();
        let file = format!("{root}/notes.txt");
        std::fs::write(&file, "hello").unwrap();

        let read = run_script(READ_SCRIPT, &[&file], b"");
        assert!(read.status.success());
        assert_eq!(read.stdout, b"hello");
        assert_eq!(run_script(READ_SCRIPT, &[&root], b"").status.code(), Some(WRONG_KIND_EXIT));
        let missing = format!("{root}/missing.txt");
        assert_eq!(
            run_script(READ_SCRIPT, &[&missing], b"").status.code(),
            Some(PATH_NOT_FOUND_EXIT)
        );

        let attachments = format!("{root}/attachments");
        assert!(run_script(WRITE_NEW_SCRIPT, &[&attachments, "a.txt"], b"first").status.success());
        assert_eq!(
            run_script(WRITE_NEW_SCRIPT, &[&attachments, "a.txt"], b"second").status.code(),
            Some(FILE_EXISTS_EXIT)
        );
        assert_eq!(std::fs::read(ws.path().join("attachments/a.txt")).unwrap(), b"first");

        assert!(run_script(DELETE_SCRIPT, &[&file], b"").status.success());
        assert!(!ws.path().join("notes.txt").exists());
        assert_eq!(
            run_script(DELETE_SCRIPT, &[&file], b"").status.code(),
            Some(PATH_NOT_FOUND_EXIT)
        );
        assert_eq!(
            run_script(DELETE_SCRIPT, &[&attachments], b"").status.code(),
            Some(WRONG_KIND_EXIT)
        );
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_fails_when_tar_fails() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("notes.txt"), "hello").unwrap();

        let out = run_snapshot_with_stubs(ws.path(), &[("tar", "exit 2")]);
        assert!(!out.status.success());
        assert!(out.stdout.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_fails_when_a_listed_file_vanishes() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("notes.txt"), "hello").unwrap();

        // `sort -o OUT IN`: copy the list, then name a file that no longer exists.
        let sort = r#"cat "$3" > "$2"; echo vanished.txt >> "$2""#;
        let out = run_snapshot_with_stubs(ws.path(), &[("sort", sort)]);
        assert!(!out.status.success());
        assert!(out.stdout.is_empty());
    }
}
