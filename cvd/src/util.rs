use std::path::{Component, Path, PathBuf};

/// Quote `s` for pasting into a POSIX shell. Words made only of
/// characters the shell treats literally are left alone.
pub(crate) fn shell_quote(s: &str) -> String {
    let literal = |c: char| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c);
    if !s.is_empty() && s.chars().all(literal) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Resolve `path` against `base` without touching the filesystem.
///
/// `.` components are dropped and `..` pops the previous component, so
/// symlinks are not followed.
pub(crate) fn absolute_path(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_leaves_plain_words() {
        assert_eq!(shell_quote("/host/bin/launch_cvd"), "/host/bin/launch_cvd");
        assert_eq!(shell_quote("--daemon=true"), "--daemon=true");
    }

    #[test]
    fn shell_quote_wraps_special_words() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("my group"), "'my group'");
        assert_eq!(shell_quote("--instance_nums=1,3"), "'--instance_nums=1,3'");
        assert_eq!(shell_quote("$(id)"), "'$(id)'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn absolute_path_resolves_relative() {
        let base = Path::new("/work/dir");
        assert_eq!(absolute_path(base, Path::new("homes/a")), PathBuf::from("/work/dir/homes/a"));
        assert_eq!(absolute_path(base, Path::new("./a/../b")), PathBuf::from("/work/dir/b"));
        assert_eq!(absolute_path(base, Path::new("../../..")), PathBuf::from("/"));
    }

    #[test]
    fn absolute_path_keeps_absolute() {
        let base = Path::new("/work");
        assert_eq!(absolute_path(base, Path::new("/tmp/./x")), PathBuf::from("/tmp/x"));
    }
}
