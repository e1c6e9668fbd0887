//! User-script feed sources.
//!
//! A script lives under the scripts root, is executed with a working
//! directory of that root, and must print a standard feed XML document on
//! stdout, which is handed to the standard parser. Interpreter selection is
//! a closed table keyed by file extension; arguments are passed as argv
//! entries, never through a shell.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{standard, CanonicalItem, ParseError};
use crate::storage::ScriptConfig;

/// Wall-clock budget for one script run.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How much trailing stderr to keep as the user-visible diagnostic.
const STDERR_TAIL: usize = 500;

/// Execute a configured script and parse its stdout as a feed.
pub async fn run(
    scripts_root: &Path,
    config: &ScriptConfig,
) -> Result<Vec<CanonicalItem>, ParseError> {
    let script = contain_path(scripts_root, &config.path)?;
    let program = interpreter_for(&script)?;

    let mut command = match program {
        Some(interpreter) => {
            let mut c = Command::new(interpreter);
            c.arg(&script);
            c
        }
        None => Command::new(&script),
    };

    let child = command
        .current_dir(scripts_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ParseError::Script {
            status: "spawn failed".to_string(),
            stderr_tail: e.to_string(),
        })?;

    let output = match tokio::time::timeout(SCRIPT_TIMEOUT, collect_output(child)).await {
        Ok(result) => result?,
        Err(_) => {
            // kill_on_drop reaps the child when the future is dropped here.
            return Err(ParseError::Script {
                status: "timeout".to_string(),
                stderr_tail: format!("script exceeded {} s wall clock", SCRIPT_TIMEOUT.as_secs()),
            });
        }
    };

    if !output.status.success() {
        return Err(ParseError::Script {
            status: output
                .status
                .code()
                .map(|c| format!("exit {}", c))
                .unwrap_or_else(|| "killed".to_string()),
            stderr_tail: tail(&output.stderr),
        });
    }

    standard::parse(&output.stdout)
}

struct ScriptOutput {
    status: std::process::ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

async fn collect_output(mut child: tokio::process::Child) -> Result<ScriptOutput, ParseError> {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    // Drain both pipes while waiting, so a chatty script cannot deadlock on
    // a full pipe buffer.
    let (status, _, _) = tokio::try_join!(
        async {
            child.wait().await.map_err(|e| ParseError::Script {
                status: "wait failed".to_string(),
                stderr_tail: e.to_string(),
            })
        },
        async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                pipe.read_to_end(&mut stdout).await.map_err(|e| ParseError::Script {
                    status: "stdout read failed".to_string(),
                    stderr_tail: e.to_string(),
                })?;
            }
            Ok(())
        },
        async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_end(&mut stderr).await.map_err(|e| ParseError::Script {
                    status: "stderr read failed".to_string(),
                    stderr_tail: e.to_string(),
                })?;
            }
            Ok(())
        },
    )?;

    Ok(ScriptOutput {
        status,
        stdout,
        stderr,
    })
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let start = text.len() - STDERR_TAIL;
    // Avoid slicing mid-codepoint.
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(start);
    text[start..].to_string()
}

// ============================================================================
// Path Containment
// ============================================================================

/// Resolve a configured script path, rejecting every way out of the
/// scripts root: absolute paths, `..` traversal, and symlinks that resolve
/// outside the root. Checked before execution, never after.
fn contain_path(scripts_root: &Path, configured: &str) -> Result<PathBuf, ParseError> {
    let relative = Path::new(configured);

    if relative.is_absolute() {
        return Err(ParseError::Config(
            "script path must be relative to the scripts directory".to_string(),
        ));
    }
    if relative
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(ParseError::Config(
            "script path must not contain '..'".to_string(),
        ));
    }

    let root = scripts_root
        .canonicalize()
        .map_err(|e| ParseError::Config(format!("scripts directory unavailable: {}", e)))?;

    let resolved = root
        .join(relative)
        .canonicalize()
        .map_err(|e| ParseError::Config(format!("script not found: {}", e)))?;

    if !resolved.starts_with(&root) {
        return Err(ParseError::Config(
            "script path escapes the scripts directory".to_string(),
        ));
    }

    Ok(resolved)
}

/// Closed interpreter table. `None` means execute the file directly.
fn interpreter_for(script: &Path) -> Result<Option<&'static str>, ParseError> {
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => Ok(Some("python")),
        Some("sh") => Ok(Some("bash")),
        Some("ps1") => Ok(Some("pwsh")),
        Some("js") => Ok(Some("node")),
        Some("rb") => Ok(Some("ruby")),
        None => Ok(None),
        Some(other) => Err(ParseError::Config(format!(
            "unsupported script extension: .{}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts_root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    const FEED_EMITTER: &str = r#"#!/usr/bin/env bash
cat <<'XML'
<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Scripted</title>
  <item><guid>s1</guid><title>From Script</title></item>
</channel></rss>
XML
"#;

    #[tokio::test]
    async fn test_script_output_parsed_as_feed() {
        let root = scripts_root();
        write_script(root.path(), "emit.sh", FEED_EMITTER);

        let items = run(
            root.path(),
            &ScriptConfig {
                path: "emit.sh".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "From Script");
    }

    #[tokio::test]
    async fn test_nonzero_exit_surfaces_stderr() {
        let root = scripts_root();
        write_script(
            root.path(),
            "fail.sh",
            "#!/usr/bin/env bash\necho boom >&2\nexit 3\n",
        );

        let err = run(
            root.path(),
            &ScriptConfig {
                path: "fail.sh".into(),
            },
        )
        .await
        .unwrap_err();

        match err {
            ParseError::Script {
                status,
                stderr_tail,
            } => {
                assert_eq!(status, "exit 3");
                assert!(stderr_tail.contains("boom"));
            }
            other => panic!("expected Script error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parent_traversal_rejected() {
        let root = scripts_root();
        let err = run(
            root.path(),
            &ScriptConfig {
                path: "../evil.sh".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ParseError::Config(_)));
    }

    #[tokio::test]
    async fn test_absolute_path_rejected() {
        let root = scripts_root();
        let err = run(
            root.path(),
            &ScriptConfig {
                path: "/usr/bin/env".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ParseError::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let root = scripts_root();
        let outside = tempfile::tempdir().unwrap();
        write_script(outside.path(), "evil.sh", FEED_EMITTER);
        std::os::unix::fs::symlink(outside.path().join("evil.sh"), root.path().join("link.sh"))
            .unwrap();

        let err = run(
            root.path(),
            &ScriptConfig {
                path: "link.sh".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ParseError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_extension_rejected() {
        let root = scripts_root();
        write_script(root.path(), "feed.exe", "MZ");

        let err = run(
            root.path(),
            &ScriptConfig {
                path: "feed.exe".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ParseError::Config(_)));
    }
}
