use nix::unistd::geteuid;
use std::path::Path;
use thiserror::Error;

const PASSWD_PATH: &str = "/etc/passwd";
const GROUP_PATH: &str = "/etc/group";

/// Identity applied to a launched child: uid, primary gid, and the
/// supplementary groups the user is a member of (primary excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user not found: {0:?}")]
    UserNotFound(String),
    #[error("malformed id field {field:?} in {file}: {source}")]
    BadField {
        file: String,
        field: String,
        source: std::num::ParseIntError,
    },
    #[error("read {file}: {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },
}

/// Resolve a username against the host's flat user/group databases.
///
/// Returns `None` when the resolved uid equals the supervisor's own effective
/// uid: a privilege change would be a no-op and may require root, so the
/// child is launched without credentials.
///
/// The name-service switch is deliberately bypassed; resolution reads
/// `/etc/passwd` and `/etc/group` directly, which keeps it deterministic at
/// the cost of not seeing directory-service users.
pub fn build_credential(username: &str) -> Result<Option<Credential>, CredentialError> {
    build_credential_from(
        username,
        Path::new(PASSWD_PATH),
        Path::new(GROUP_PATH),
        geteuid().as_raw(),
    )
}

fn read_db(path: &Path) -> Result<String, CredentialError> {
    std::fs::read_to_string(path).map_err(|e| CredentialError::Io {
        file: path.display().to_string(),
        source: e,
    })
}

fn parse_id(path: &Path, field: &str) -> Result<u32, CredentialError> {
    field.parse().map_err(|e| CredentialError::BadField {
        file: path.display().to_string(),
        field: field.to_string(),
        source: e,
    })
}

pub(crate) fn build_credential_from(
    username: &str,
    passwd_path: &Path,
    group_path: &Path,
    own_uid: u32,
) -> Result<Option<Credential>, CredentialError> {
    let username = username.trim();

    let mut found: Option<(u32, u32)> = None;
    let passwd = read_db(passwd_path)?;
    for line in passwd.split('\n') {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 {
            continue;
        }
        if fields[0] != username {
            continue;
        }
        let uid = parse_id(passwd_path, fields[2])?;
        let gid = parse_id(passwd_path, fields[3])?;
        found = Some((uid, gid));
        break;
    }
    let Some((uid, gid)) = found else {
        return Err(CredentialError::UserNotFound(username.to_string()));
    };

    // Already running as that user; don't pass credentials (setuid would
    // require root for no effect).
    if uid == own_uid {
        return Ok(None);
    }

    let mut groups: Vec<u32> = Vec::new();
    let group = read_db(group_path)?;
    for line in group.split('\n') {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            continue;
        }
        for member in fields[3].split(',') {
            if member.trim() != username {
                continue;
            }
            let g = parse_id(group_path, fields[2])?;
            if g != gid {
                groups.push(g);
            }
        }
    }

    Ok(Some(Credential { uid, gid, groups }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
svc:x:1042:1042:service user:/home/svc:/bin/sh
";

    const GROUP: &str = "\
root:x:0:
svc:x:1042:svc
adm:x:4:svc,operator
video:x:44:operator
render:x:107: svc
short:x:9
";

    #[test]
    fn resolves_uid_gid_and_supplementary_groups() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = write_file(dir.path(), "passwd", PASSWD);
        let group = write_file(dir.path(), "group", GROUP);

        let cred = build_credential_from("svc", &passwd, &group, 0)
            .unwrap()
            .unwrap();
        assert_eq!(cred.uid, 1042);
        assert_eq!(cred.gid, 1042);
        // Member entries are trimmed; 1042 is the primary gid and stays out
        // of the supplementary set even though the svc group lists svc.
        assert_eq!(cred.groups, vec![4, 107]);
    }

    #[test]
    fn username_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = write_file(dir.path(), "passwd", PASSWD);
        let group = write_file(dir.path(), "group", GROUP);

        let cred = build_credential_from(" svc \n", &passwd, &group, 0)
            .unwrap()
            .unwrap();
        assert_eq!(cred.uid, 1042);
    }

    #[test]
    fn missing_user_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = write_file(dir.path(), "passwd", PASSWD);
        let group = write_file(dir.path(), "group", GROUP);

        let err = build_credential_from("nobody2", &passwd, &group, 0).unwrap_err();
        assert!(matches!(err, CredentialError::UserNotFound(_)));
    }

    #[test]
    fn own_uid_means_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = write_file(dir.path(), "passwd", PASSWD);
        let group = write_file(dir.path(), "group", GROUP);

        let r = build_credential_from("svc", &passwd, &group, 1042).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn malformed_uid_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = write_file(dir.path(), "passwd", "bad:x:not-a-uid:1:::\n");
        let group = write_file(dir.path(), "group", GROUP);

        let err = build_credential_from("bad", &passwd, &group, 0).unwrap_err();
        assert!(matches!(err, CredentialError::BadField { .. }));
    }

    #[test]
    fn missing_passwd_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let group = write_file(dir.path(), "group", GROUP);

        let err =
            build_credential_from("svc", &dir.path().join("nope"), &group, 0).unwrap_err();
        assert!(matches!(err, CredentialError::Io { .. }));
    }
}
