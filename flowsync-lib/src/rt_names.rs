//! Routing-table name lookup, a trimmed-down take on iproute2's rt_names:
//! builtin names, `/etc/iproute2/rt_tables` shadowing the distribution copy
//! under `/usr/lib`, plus the `rt_tables.d` drop-in directories.

use std::fs;
use std::path::Path;

const CONF_ETC_DIR: &str = "/etc/iproute2";
const CONF_USR_DIR: &str = "/usr/lib/iproute2";

const RT_TABLE_DEFAULT: u32 = 253;
const RT_TABLE_MAIN: u32 = 254;
const RT_TABLE_LOCAL: u32 = 255;

const BUILTIN: &[(u32, &str)] = &[
    (RT_TABLE_DEFAULT, "default"),
    (RT_TABLE_MAIN, "main"),
    (RT_TABLE_LOCAL, "local"),
];

#[derive(Debug, Default)]
pub struct RtNames {
    entries: Vec<(u32, String)>,
}

/// `id name`, id decimal or 0x-hex, hash comments and blank lines skipped.
/// A line that is neither is a corrupt database.
fn parse_line(line: &str) -> Result<Option<(u32, String)>, ()> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = trimmed.split_whitespace();
    let id = tokens.next().ok_or(())?;
    let name = tokens.next().ok_or(())?;
    match tokens.next() {
        None => {}
        Some(rest) if rest.starts_with('#') => {}
        Some(_) => return Err(()),
    }

    let id = match id.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|_| ())?,
        None => id.parse().map_err(|_| ())?,
    };
    Ok(Some((id, name.to_string())))
}

impl RtNames {
    /// Load the system databases. Missing files are fine; a corrupt file is
    /// reported and skipped from the corrupt line on.
    pub fn load() -> RtNames {
        let mut names = RtNames::default();
        names.read_file(Path::new(CONF_ETC_DIR).join("rt_tables").as_path());
        names.read_file(Path::new(CONF_USR_DIR).join("rt_tables").as_path());

        // drop-ins under /usr apply unless a file of the same name exists
        // under /etc
        names.read_dir(
            Path::new(CONF_USR_DIR).join("rt_tables.d").as_path(),
            Some(Path::new(CONF_ETC_DIR).join("rt_tables.d").as_path()),
        );
        names.read_dir(Path::new(CONF_ETC_DIR).join("rt_tables.d").as_path(), None);
        names
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        BUILTIN
            .iter()
            .find(|(_, n)| *n == name)
            .map(|&(id, _)| id)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(_, n)| n == name)
                    .map(|&(id, _)| id)
            })
    }

    fn add_entries(&mut self, content: &str, origin: &Path) {
        for line in content.lines() {
            match parse_line(line) {
                Ok(Some(entry)) => self.entries.push(entry),
                Ok(None) => {}
                Err(()) => {
                    tracing::warn!(path = %origin.display(), line, "corrupt rt_tables database");
                    return;
                }
            }
        }
    }

    fn read_file(&mut self, path: &Path) {
        if let Ok(content) = fs::read_to_string(path) {
            self.add_entries(&content, path);
        }
    }

    fn read_dir(&mut self, dir: &Path, shadowed_by: Option<&Path>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || !name.ends_with(".conf") {
                continue;
            }
            if let Some(shadow) = shadowed_by
                && shadow.join(name).exists()
            {
                continue;
            }
            self.read_file(&entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_resolve() {
        let names = RtNames::default();
        assert_eq!(names.lookup("main"), Some(254));
        assert_eq!(names.lookup("local"), Some(255));
        assert_eq!(names.lookup("default"), Some(253));
        assert_eq!(names.lookup("nope"), None);
    }

    #[test]
    fn database_lines_parse() {
        assert_eq!(parse_line("100 fastpath"), Ok(Some((100, "fastpath".into()))));
        assert_eq!(parse_line("0x64 hexpath"), Ok(Some((100, "hexpath".into()))));
        assert_eq!(parse_line("  42 spaced # why"), Ok(Some((42, "spaced".into()))));
        assert_eq!(parse_line("# comment"), Ok(None));
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("borked"), Err(()));
        assert_eq!(parse_line("12 two words"), Err(()));
    }

    #[test]
    fn loaded_entries_resolve_after_builtins() {
        let mut names = RtNames::default();
        names.add_entries("100 fastpath\n200 main\n", Path::new("test"));
        assert_eq!(names.lookup("fastpath"), Some(100));
        // builtins win over redefinitions
        assert_eq!(names.lookup("main"), Some(254));
    }

    #[test]
    fn corrupt_database_stops_at_the_bad_line() {
        let mut names = RtNames::default();
        names.add_entries("100 good\nnot a table\n200 after\n", Path::new("test"));
        assert_eq!(names.lookup("good"), Some(100));
        assert_eq!(names.lookup("after"), None);
    }
}
