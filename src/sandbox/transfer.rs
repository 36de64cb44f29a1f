//! File and archive transfer between the host and a sandbox.
//!
//! Inbound data goes through the staging area that is mounted into every
//! sandbox; outbound data is copied out by the runtime.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs_extra::file::{CopyOptions, move_file};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::sandbox::container::Sandbox;
use crate::shell::{Arg, CommandLine};

/// Write `data` to a fresh file in the staging area and return its host path.
pub(crate) fn stage(config: &Config, prefix: &str, data: &[u8]) -> Result<PathBuf> {
    let dir = config.staging_dir();
    let step = || format!("staging into {}", dir.display());
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(&dir)
        .map_err(|e| SandboxError::transfer(step(), e))?;
    file.write_all(data)
        .and_then(|_| file.flush())
        .map_err(|e| SandboxError::transfer(step(), e))?;
    file.into_temp_path()
        .keep()
        .map_err(|e| SandboxError::transfer(step(), e))
}

/// A name that is unique across sandboxes sharing the staging area.
fn unique_suffix() -> Result<String> {
    let mut buf = [0u8; 8];
    getrandom::fill(&mut buf)
        .map_err(|e| SandboxError::transfer("generating a temp name", e))?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}

impl Sandbox {
    /// Place `data` at `path` inside the sandbox.
    ///
    /// The final step is a `mv` inside the sandbox, so readers there never see
    /// a partially written file when staging and target share a filesystem.
    pub fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> Result<()> {
        let staged = stage(self.config(), "cephbox-put-", data.as_ref())?;
        let source = self.config().sandbox_path_for(&staged);
        let status = match self.run(CommandLine::args(["mv", source.as_str(), path])) {
            Ok(status) => status,
            Err(e) => {
                let _ = fs::remove_file(&staged);
                return Err(e);
            }
        };
        if status != 0 {
            let _ = fs::remove_file(&staged);
            return Err(SandboxError::transfer(
                format!("moving into {}", path),
                format!("mv exited with status {}", status),
            ));
        }
        Ok(())
    }

    /// Like [`Sandbox::write_file`], reading the payload from `reader`.
    pub fn write_file_from(&self, path: &str, mut reader: impl Read) -> Result<()> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| SandboxError::transfer("reading payload", e))?;
        self.write_file(path, data)
    }

    /// Write a file, then optionally adjust its mode and owner.
    pub fn sudo_write_file(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
        perms: Option<&str>,
        owner: Option<&str>,
    ) -> Result<()> {
        self.write_file(path, data)?;
        if let Some(perms) = perms {
            self.checked(CommandLine::args(["chmod", perms, path]), "chmod")?;
        }
        if let Some(owner) = owner {
            self.checked(CommandLine::args(["chown", owner, path]), "chown")?;
        }
        Ok(())
    }

    /// Copy `path` out of the sandbox into a new file under `dest_dir`.
    ///
    /// The caller owns the returned file.
    pub fn read_file(&self, path: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.ensure_running()?;
        let local = tempfile::Builder::new()
            .prefix("cephbox-get-")
            .tempfile_in(dest_dir)
            .and_then(|f| f.into_temp_path().keep().map_err(Into::into))
            .map_err(|e| SandboxError::transfer(format!("creating a file in {}", dest_dir.display()), e))?;

        if let Err(e) = self.runtime().copy_out(self.name(), path, &local) {
            let _ = fs::remove_file(&local);
            return Err(SandboxError::transfer(format!("copying out {}", path), e));
        }
        info!(sandbox = %self.name(), "copied {} to {}", path, local.display());
        Ok(local)
    }

    /// Archive the directory `path` inside the sandbox into `destination`.
    ///
    /// Runs `tar` in the sandbox, copies the archive out, then moves it into
    /// place. The archive left inside the sandbox is removed on a best-effort
    /// basis whether or not the later steps succeed.
    pub fn get_tar(&self, path: &str, destination: &Path, sudo: bool) -> Result<()> {
        let remote = format!("/tmp/cephbox-{}.tar.gz", unique_suffix()?);

        let mut args = Vec::new();
        if sudo {
            args.push(Arg::from("sudo"));
        }
        args.extend(
            ["tar", "cz", "-f", remote.as_str(), "-C", path, "--", "."]
                .into_iter()
                .map(Arg::from),
        );
        args.push(Arg::raw("&&"));
        args.extend(["chmod", "0666", remote.as_str()].into_iter().map(Arg::from));

        let result = self.fetch_archive(args, &remote, destination);
        self.remove_remote(&remote, sudo);
        result
    }

    fn fetch_archive(&self, args: Vec<Arg>, remote: &str, destination: &Path) -> Result<()> {
        let status = self.run(args)?;
        if status != 0 {
            return Err(SandboxError::transfer(
                "archiving",
                format!("tar exited with status {}", status),
            ));
        }

        let local = self.read_file(remote, &self.config().staging_dir())?;
        info!("mv {} {}", local.display(), destination.display());
        let options = CopyOptions::new().overwrite(true);
        if let Err(e) = move_file(&local, destination, &options) {
            let _ = fs::remove_file(&local);
            return Err(SandboxError::transfer(
                format!("moving archive to {}", destination.display()),
                e,
            ));
        }
        Ok(())
    }

    fn remove_remote(&self, remote: &str, sudo: bool) {
        let mut args = Vec::new();
        if sudo {
            args.push(Arg::from("sudo"));
        }
        args.extend(["rm", "-f", remote].into_iter().map(Arg::from));
        match self.run(args) {
            Ok(0) => {}
            Ok(status) => warn!(sandbox = %self.name(), status, "transfer:leftover {}", remote),
            Err(e) => warn!(sandbox = %self.name(), error = %e, "transfer:leftover {}", remote),
        }
    }

    fn checked(&self, line: CommandLine, step: &str) -> Result<()> {
        match self.run(line)? {
            0 => Ok(()),
            status => Err(SandboxError::transfer(
                step,
                format!("exited with status {}", status),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testutil::FakeRuntime;
    use std::process::Command;

    fn sandbox(fake: &FakeRuntime) -> Sandbox {
        Sandbox::new("box1", "ubuntu", "14.04", fake.settings())
    }

    #[test]
    fn test_stage_writes_into_staging_area() {
        let fake = FakeRuntime::new();
        let path = stage(&fake.config, "cephbox-put-", b"abc").unwrap();
        assert_eq!(path.parent().unwrap(), fake.staging());
        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_unique_suffix() {
        let a = unique_suffix().unwrap();
        let b = unique_suffix().unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_write_file() {
        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let target = fake.path().join("written.txt");
        sb.write_file(&target.to_string_lossy(), "hello\n").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "hello\n");
        assert_eq!(fs::read_dir(fake.staging()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_file_from_reader() {
        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let target = fake.path().join("from-reader.txt");
        sb.write_file_from(&target.to_string_lossy(), &b"payload"[..])
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn test_write_file_into_missing_dir_fails() {
        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let target = fake.path().join("no/such/dir/file");
        let err = sb.write_file(&target.to_string_lossy(), "x").unwrap_err();
        assert!(matches!(err, SandboxError::TransferFailed { .. }));
        assert_eq!(fs::read_dir(fake.staging()).unwrap().count(), 0);
    }

    #[test]
    fn test_sudo_write_file_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let target = fake.path().join("mode.txt");
        sb.sudo_write_file(&target.to_string_lossy(), "x", Some("0640"), None)
            .unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_read_file() {
        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let source = fake.path().join("inside.txt");
        fs::write(&source, "contents").unwrap();
        let out_dir = tempfile::tempdir().unwrap();

        let local = sb.read_file(&source.to_string_lossy(), out_dir.path()).unwrap();
        assert!(local.starts_with(out_dir.path()));
        assert_eq!(fs::read_to_string(&local).unwrap(), "contents");
    }

    #[test]
    fn test_read_missing_file_fails() {
        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let out_dir = tempfile::tempdir().unwrap();
        let err = sb.read_file("/nonexistent/file", out_dir.path()).unwrap_err();
        assert!(matches!(err, SandboxError::TransferFailed { .. }));
        assert_eq!(fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_get_tar() {
        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let tree = fake.path().join("tree");
        fs::create_dir_all(tree.join("sub")).unwrap();
        fs::write(tree.join("a.txt"), "a").unwrap();
        fs::write(tree.join("sub/b.txt"), "b").unwrap();
        let destination = fake.path().join("tree.tar.gz");

        sb.get_tar(&tree.to_string_lossy(), &destination, false).unwrap();

        let listing = Command::new("tar")
            .arg("tzf")
            .arg(&destination)
            .output()
            .unwrap();
        let listing = String::from_utf8_lossy(&listing.stdout);
        assert!(listing.lines().any(|l| l == "./a.txt"));
        assert!(listing.lines().any(|l| l == "./sub/b.txt"));
        assert!(fake.calls().iter().any(|c| c.starts_with("cp box1:/tmp/cephbox-")));
    }

    #[test]
    fn test_get_tar_of_missing_dir_fails() {
        let fake = FakeRuntime::new();
        let sb = sandbox(&fake);
        let destination = fake.path().join("missing.tar.gz");
        let err = sb
            .get_tar("/nonexistent/dir", &destination, false)
            .unwrap_err();
        assert!(matches!(err, SandboxError::TransferFailed { .. }));
        assert!(!destination.exists());
    }
}
