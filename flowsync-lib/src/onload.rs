//! Named prefix lists whose prefixes get static trap rules, keeping the
//! matching traffic on the host ("onloaded") instead of offloaded.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::addr::AfAddr;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to parse prefix `{prefix}`")]
    BadPrefix { prefix: String },
    #[error("{path}:{line}: unable to parse line `{content}`")]
    BadLine {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("unable to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct PrefixList {
    pub name: String,
    pub prefixes: Vec<AfAddr>,
}

/// All configured lists, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct PrefixLists {
    lists: Vec<PrefixList>,
}

fn parse_prefix(s: &str) -> Option<AfAddr> {
    // a bare address parses as a full-length prefix
    s.parse::<cidr::IpCidr>().ok().map(AfAddr::from)
}

/// A line is a single prefix, optionally surrounded by whitespace and
/// followed by a `#` comment. Blank and comment-only lines carry nothing.
fn parse_line(line: &str) -> Result<Option<AfAddr>, ()> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let end = trimmed
        .find(|c: char| c.is_whitespace() || c == '#')
        .unwrap_or(trimmed.len());
    let (token, rest) = trimmed.split_at(end);
    let rest = rest.trim_start();
    if !rest.is_empty() && !rest.starts_with('#') {
        return Err(());
    }

    parse_prefix(token).map(Some).ok_or(())
}

impl PrefixLists {
    fn list_mut(&mut self, name: &str) -> &mut PrefixList {
        if let Some(i) = self.lists.iter().position(|l| l.name == name) {
            return &mut self.lists[i];
        }
        self.lists.push(PrefixList {
            name: name.to_string(),
            prefixes: Vec::new(),
        });
        self.lists.last_mut().expect("just pushed")
    }

    pub fn add_prefix(&mut self, list: &str, prefix: &str) -> Result<(), Error> {
        let parsed = parse_prefix(prefix).ok_or_else(|| Error::BadPrefix {
            prefix: prefix.to_string(),
        })?;
        self.list_mut(list).prefixes.push(parsed);
        Ok(())
    }

    /// Load a prefix file into `list`; a malformed line aborts the load.
    pub fn load_file(&mut self, list: &str, path: &Path) -> Result<(), Error> {
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_reader(list, BufReader::new(file), path)
    }

    fn load_reader(
        &mut self,
        list: &str,
        reader: impl BufRead,
        path: &Path,
    ) -> Result<(), Error> {
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            match parse_line(&line) {
                Ok(Some(prefix)) => self.list_mut(list).prefixes.push(prefix),
                Ok(None) => {}
                Err(()) => {
                    return Err(Error::BadLine {
                        path: path.to_path_buf(),
                        line: lineno + 1,
                        content: line,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&PrefixList> {
        self.lists.iter().find(|l| l.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrefixList> {
        self.lists.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Family;

    #[test]
    fn add_prefix_parses_and_orders() -> anyhow::Result<()> {
        let mut lists = PrefixLists::default();
        lists.add_prefix("onload", "192.0.2.0/24")?;
        lists.add_prefix("onload", "2001:db8::/48")?;
        lists.add_prefix("extra", "198.51.100.7")?;

        let onload = lists.lookup("onload").expect("onload list");
        assert_eq!(onload.prefixes.len(), 2);
        assert_eq!(onload.prefixes[0].family(), Family::V4);
        assert_eq!(onload.prefixes[0].mask_len, 24);
        assert_eq!(onload.prefixes[1].family(), Family::V6);

        // a bare address gets the family's full mask
        let extra = lists.lookup("extra").expect("extra list");
        assert_eq!(extra.prefixes[0].mask_len, 32);

        assert!(lists.lookup("nope").is_none());
        Ok(())
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let mut lists = PrefixLists::default();
        assert!(lists.add_prefix("onload", "not-a-prefix").is_err());
        assert!(lists.add_prefix("onload", "192.0.2.0/40").is_err());
    }

    #[test]
    fn file_syntax() -> anyhow::Result<()> {
        let input = "\
# leading comment

192.0.2.0/24
   198.51.100.0/25\t
2001:db8::/48 # trailing comment
\t# indented comment
";
        let mut lists = PrefixLists::default();
        lists.load_reader("onload", input.as_bytes(), Path::new("test.txt"))?;
        let list = lists.lookup("onload").expect("list");
        assert_eq!(list.prefixes.len(), 3);
        assert_eq!(list.prefixes[1].to_string(), "198.51.100.0/25");
        Ok(())
    }

    #[test]
    fn malformed_line_aborts_loading() {
        let input = "192.0.2.0/24\n192.0.2.0/24 junk\n";
        let mut lists = PrefixLists::default();
        let err = lists
            .load_reader("onload", input.as_bytes(), Path::new("test.txt"))
            .expect_err("must fail");
        match err {
            Error::BadLine { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
