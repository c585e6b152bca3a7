//! Instruction execution against a prepared chroot session.

use std::fs;
use std::path::Path;

use chmo_common::{ChmoError, ChmoResult};
use chmo_image::{ImageStore, tar};
use console::style;

use crate::chroot::ChrootSession;
use crate::recipe::{Instruction, Op};

/// Execute one instruction.
///
/// Comments and `FROM` are no-ops here — the planner already consumed
/// stage boundaries. Every other instruction echoes its raw line before
/// dispatch so the operator sees what is running.
///
/// # Errors
///
/// Propagates the dispatch errors of each instruction kind;
/// [`ChmoError::UnsupportedInstruction`] for anything not implemented.
pub async fn execute(
    session: &ChrootSession,
    store: &ImageStore,
    instruction: &Instruction,
) -> ChmoResult<()> {
    if matches!(instruction.op, Op::Comment | Op::From) {
        return Ok(());
    }

    println!("{}", style(&instruction.raw_line).yellow());

    match &instruction.op {
        Op::Run => session.exec(&instruction.value, false, &[]).await,
        Op::Add => run_add(session, &instruction.value).await,
        Op::Copy => run_copy(session, store, &instruction.value),
        Op::Other(token) => Err(ChmoError::UnsupportedInstruction {
            instruction: token.clone(),
        }),
        Op::Comment | Op::From => Ok(()),
    }
}

/// `ADD <src> <dst>`: URL download, directory merge, tar extraction or
/// plain file copy into the image tree.
async fn run_add(session: &ChrootSession, value: &str) -> ChmoResult<()> {
    let (src, dst) = split_src_dst("ADD", value)?;

    let target = session.mount_root().join(dst.trim_start_matches('/'));
    fs::create_dir_all(&target)?;

    if let Some(url) = parse_url(src) {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ChmoError::SourceNotFound {
                path: src.to_string(),
            })?
            .to_string();
        return download(&url, &target.join(name)).await;
    }

    let src_path = Path::new(src);
    if !src_path.exists() {
        return Err(ChmoError::SourceNotFound {
            path: src.to_string(),
        });
    }

    let name = src_path
        .file_name()
        .ok_or_else(|| ChmoError::SourceNotFound {
            path: src.to_string(),
        })?;

    if src_path.is_dir() {
        copy_dir_recursive(src_path, &target.join(name))
    } else if tar::is_tar_file(src_path) {
        tar::extract(src_path, &target, None)
    } else {
        fs::copy(src_path, target.join(name))?;
        Ok(())
    }
}

/// `COPY --from=<stage> <src> <dst>`: extract the matching members of a
/// previous stage's tar into the image root. Plain `COPY` is not
/// implemented.
fn run_copy(session: &ChrootSession, store: &ImageStore, value: &str) -> ChmoResult<()> {
    let tokens: Vec<&str> = value.split_whitespace().collect();

    let Some(stage) = tokens.first().and_then(|t| t.strip_prefix("--from=")) else {
        return Err(ChmoError::UnsupportedInstruction {
            instruction: "COPY".to_string(),
        });
    };
    let [_, src, _dst] = tokens.as_slice() else {
        return Err(ChmoError::RecipeParse {
            line: format!("COPY {value}"),
        });
    };

    let prefix = src.trim_start_matches('/');
    match tar::extract(&store.tar_path(stage), session.mount_root(), Some(prefix)) {
        Err(ChmoError::EmptyFilter { .. }) => Err(ChmoError::PathNotFoundInStage {
            path: (*src).to_string(),
            stage: stage.to_string(),
        }),
        other => other,
    }
}

fn split_src_dst<'a>(op: &str, value: &'a str) -> ChmoResult<(&'a str, &'a str)> {
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(src), Some(dst), None) => Ok((src, dst)),
        _ => Err(ChmoError::RecipeParse {
            line: format!("{op} {value}"),
        }),
    }
}

fn parse_url(src: &str) -> Option<reqwest::Url> {
    reqwest::Url::parse(src)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

async fn download(url: &reqwest::Url, dest: &Path) -> ChmoResult<()> {
    tracing::info!(url = %url, dest = %dest.display(), "Downloading");
    let map_err = |err: reqwest::Error| ChmoError::Download {
        url: url.to_string(),
        message: err.to_string(),
    };
    let response = reqwest::get(url.clone())
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(map_err)?;
    let bytes = response.bytes().await.map_err(map_err)?;
    fs::write(dest, &bytes)?;
    Ok(())
}

/// Copy a directory recursively, merging into existing contents.
fn copy_dir_recursive(src: &Path, dest: &Path) -> ChmoResult<()> {
    fs::create_dir_all(dest)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());

        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dest_path)?;
        } else {
            fs::copy(&src_path, &dest_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chmo_common::ChmoPaths;
    use tempfile::tempdir;

    fn instruction(op: Op, value: &str, raw: &str) -> Instruction {
        Instruction {
            op,
            value: value.to_string(),
            raw_line: raw.to_string(),
        }
    }

    fn fixture(key: &str) -> (tempfile::TempDir, ImageStore, ChrootSession) {
        let temp = tempdir().unwrap();
        let paths = ChmoPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        let store = ImageStore::new(paths);
        fs::create_dir_all(store.mount_path(key)).unwrap();
        let session = ChrootSession::new(&store, key).unwrap();
        (temp, store, session)
    }

    #[tokio::test]
    async fn comments_and_from_are_no_ops() {
        let (_temp, store, session) = fixture("img");
        execute(&session, &store, &instruction(Op::Comment, "x", "# x"))
            .await
            .unwrap();
        execute(&session, &store, &instruction(Op::From, "base", "FROM base"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_copies_a_plain_file() {
        let (temp, store, session) = fixture("img");
        let payload = temp.path().join("payload.bin");
        fs::write(&payload, b"raw bytes").unwrap();

        let value = format!("{} /opt", payload.display());
        execute(
            &session,
            &store,
            &instruction(Op::Add, &value, &format!("ADD {value}")),
        )
        .await
        .unwrap();

        let copied = store.mount_path("img").join("opt/payload.bin");
        assert_eq!(fs::read(copied).unwrap(), b"raw bytes");
    }

    #[tokio::test]
    async fn add_extracts_a_tar_file() {
        let (temp, store, session) = fixture("img");

        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("bin")).unwrap();
        fs::write(tree.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        let payload = temp.path().join("payload.tar");
        tar::pack(&tree, &payload).unwrap();

        let value = format!("{} /opt", payload.display());
        execute(
            &session,
            &store,
            &instruction(Op::Add, &value, &format!("ADD {value}")),
        )
        .await
        .unwrap();

        // tar members land under the destination, not under the tar's name
        assert!(store.mount_path("img").join("opt/bin/tool").exists());
        assert!(!store.mount_path("img").join("opt/payload.tar").exists());
    }

    #[tokio::test]
    async fn add_merges_a_directory() {
        let (temp, store, session) = fixture("img");
        let src = temp.path().join("conf");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/a.cfg"), b"a").unwrap();

        let existing = store.mount_path("img").join("etc/conf");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("keep.cfg"), b"keep").unwrap();

        let value = format!("{} /etc", src.display());
        execute(
            &session,
            &store,
            &instruction(Op::Add, &value, &format!("ADD {value}")),
        )
        .await
        .unwrap();

        assert!(existing.join("keep.cfg").exists());
        assert_eq!(fs::read(existing.join("sub/a.cfg")).unwrap(), b"a");
    }

    #[tokio::test]
    async fn add_missing_source_fails() {
        let (temp, store, session) = fixture("img");
        let value = format!("{}/absent /opt", temp.path().display());
        let err = execute(
            &session,
            &store,
            &instruction(Op::Add, &value, &format!("ADD {value}")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChmoError::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn copy_from_stage_extracts_matching_members() {
        let (temp, store, session) = fixture("img");

        let tree = temp.path().join("stage-root");
        fs::create_dir_all(tree.join("out")).unwrap();
        fs::write(tree.join("out/artifact"), b"built").unwrap();
        fs::write(tree.join("noise"), b"skip me").unwrap();
        tar::pack(&tree, &store.tar_path("builder")).unwrap();

        execute(
            &session,
            &store,
            &instruction(
                Op::Copy,
                "--from=builder /out /",
                "COPY --from=builder /out /",
            ),
        )
        .await
        .unwrap();

        let mount = store.mount_path("img");
        assert_eq!(fs::read(mount.join("out/artifact")).unwrap(), b"built");
        assert!(!mount.join("noise").exists());
    }

    #[tokio::test]
    async fn copy_from_missing_path_fails() {
        let (temp, store, session) = fixture("img");
        let tree = temp.path().join("stage-root");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("present"), b"x").unwrap();
        tar::pack(&tree, &store.tar_path("builder")).unwrap();

        let err = execute(
            &session,
            &store,
            &instruction(
                Op::Copy,
                "--from=builder /absent /x",
                "COPY --from=builder /absent /x",
            ),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChmoError::PathNotFoundInStage { .. }));
    }

    #[tokio::test]
    async fn plain_copy_is_unsupported() {
        let (_temp, store, session) = fixture("img");
        let err = execute(
            &session,
            &store,
            &instruction(Op::Copy, "./a /b", "COPY ./a /b"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChmoError::UnsupportedInstruction { .. }));
    }

    #[tokio::test]
    async fn unknown_instruction_is_unsupported() {
        let (_temp, store, session) = fixture("img");
        let err = execute(
            &session,
            &store,
            &instruction(Op::Other("WORKDIR".to_string()), "/app", "WORKDIR /app"),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, ChmoError::UnsupportedInstruction { instruction } if instruction == "WORKDIR")
        );
    }
}
