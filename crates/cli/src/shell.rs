//! Command interpreter behind the interactive shell.
//!
//! Every input line is one command; [`Shell::execute`] returns the lines to
//! print so the interpreter can be driven from tests without a terminal.

use std::sync::Arc;

use atom::{AtomBuilder, AttrKey, Particle};
use universe::{Condition, Index, IndexInfo, Universe};

/// What the caller should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Lines(Vec<String>),
    Exit,
}

impl Reply {
    fn line(s: impl Into<String>) -> Self {
        Reply::Lines(vec![s.into()])
    }
}

pub struct Shell {
    store: Universe,
}

impl Shell {
    pub fn new(store: Universe) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Universe {
        &self.store
    }

    pub fn into_store(self) -> Universe {
        self.store
    }

    pub fn execute(&self, line: &str) -> Reply {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Reply::Lines(Vec::new());
        };
        let args: Vec<&str> = parts.collect();

        match cmd.to_uppercase().as_str() {
            "PUT" => self.put(&args),
            "GET" => self.get(&args),
            "FIND" => self.find(&args),
            "SCAN" => self.scan(&args),
            "INDICES" => Reply::Lines(
                self.store
                    .indices()
                    .iter()
                    .map(|i| format!("{} {} ({} atoms)", i.id(), i.info().name, i.len()))
                    .collect(),
            ),
            "STATS" => Reply::line(format!("{:?}", self.store)),
            "EXIT" | "QUIT" => Reply::Exit,
            other => Reply::line(format!("unknown command: {}", other)),
        }
    }

    fn put(&self, args: &[&str]) -> Reply {
        if args.is_empty() {
            return Reply::line("ERR usage: PUT key=value [key=value ...]");
        }
        let mut junctions = Vec::with_capacity(args.len());
        for arg in args {
            match parse_junction(arg) {
                Some(j) => junctions.push(j),
                None => return Reply::line(format!("ERR bad junction: {}", arg)),
            }
        }

        let mut tx = self.store.begin();
        let handle = tx.create_atom();
        for (key, value) in junctions {
            if let Err(e) = tx.add_junction(handle, key, value) {
                return Reply::line(format!("ERR put failed: {}", e));
            }
        }
        match tx.commit() {
            Ok(c) => Reply::line(format!("OK id={} ucn={}", handle.id(), c.ucn.unwrap_or(0))),
            Err(e) => Reply::line(format!("ERR put failed: {}", e)),
        }
    }

    fn get(&self, args: &[&str]) -> Reply {
        let Some(id) = args.first().and_then(|s| s.parse::<u64>().ok()) else {
            return Reply::line("ERR usage: GET id");
        };
        match self.store.get_atom(id) {
            Some(atom) => Reply::line(atom.to_string()),
            None => Reply::line("(nil)"),
        }
    }

    fn find(&self, args: &[&str]) -> Reply {
        let Some((key, value)) = args.first().and_then(|a| parse_junction(a)) else {
            return Reply::line("ERR usage: FIND key=value");
        };
        let index = match self.index_for(key) {
            Ok(index) => index,
            Err(e) => return Reply::line(format!("ERR find failed: {}", e)),
        };
        let sample = AtomBuilder::sample().with(key, value);
        match index.search_exact(&sample) {
            Some(atom) => Reply::line(atom.to_string()),
            None => Reply::line("(nil)"),
        }
    }

    fn scan(&self, args: &[&str]) -> Reply {
        let index = match args.first() {
            None => self.store.global_index(),
            Some(k) => match k.parse::<AttrKey>() {
                Ok(key) => match self.index_for(key) {
                    Ok(index) => index,
                    Err(e) => return Reply::line(format!("ERR scan failed: {}", e)),
                },
                Err(_) => return Reply::line("ERR usage: SCAN [key]"),
            },
        };

        let mut lines = Vec::new();
        for atom in index.all() {
            match atom {
                Ok(atom) => lines.push(atom.to_string()),
                Err(e) => return Reply::line(format!("ERR scan failed: {}", e)),
            }
        }
        if lines.is_empty() {
            lines.push("(empty)".to_string());
        } else {
            lines.push(format!("({} atoms)", lines.len()));
        }
        Reply::Lines(lines)
    }

    /// The index over atoms holding `key`, sorted by it; created on first use.
    fn index_for(&self, key: AttrKey) -> Result<Arc<Index>, universe::UniverseError> {
        let name = format!("by-{}", key);
        if let Some(index) = self.store.index(&name) {
            return Ok(index);
        }
        self.store.create_index(
            IndexInfo::new(name)
                .condition(Condition::HasKey(key))
                .sort_by(key),
        )
    }
}

/// Parses `key=value`. Values that look like integers become integers.
fn parse_junction(arg: &str) -> Option<(AttrKey, Particle)> {
    let (k, v) = arg.split_once('=')?;
    let key = k.parse::<AttrKey>().ok()?;
    let value = match v.parse::<i64>() {
        Ok(n) => Particle::Integer(n),
        Err(_) => Particle::IsoString(v.to_string()),
    };
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use universe::UniverseConfig;

    fn shell() -> Shell {
        Shell::new(Universe::in_memory(UniverseConfig::default()))
    }

    fn lines(reply: Reply) -> Vec<String> {
        match reply {
            Reply::Lines(l) => l,
            Reply::Exit => panic!("unexpected exit"),
        }
    }

    #[test]
    fn parse_junction_types() {
        assert_eq!(parse_junction("1=42"), Some((1, Particle::Integer(42))));
        assert_eq!(parse_junction("2=abc"), Some((2, Particle::IsoString("abc".into()))));
        assert_eq!(parse_junction("3="), Some((3, Particle::IsoString(String::new()))));
        assert_eq!(parse_junction("x=1"), None);
        assert_eq!(parse_junction("novalue"), None);
    }

    #[test]
    fn put_then_get() {
        let sh = shell();
        assert_eq!(lines(sh.execute("PUT 1=alice 2=30")), vec!["OK id=0 ucn=1"]);
        assert_eq!(lines(sh.execute("get 0")), vec![r#"#0@1 {1="alice", 2=30}"#]);
        assert_eq!(lines(sh.execute("GET 9")), vec!["(nil)"]);
    }

    #[test]
    fn find_uses_a_key_index() {
        let sh = shell();
        sh.execute("PUT 1=alice");
        sh.execute("PUT 1=bob 2=7");
        assert_eq!(lines(sh.execute("FIND 1=bob")), vec![r#"#1@2 {1="bob", 2=7}"#]);
        assert_eq!(lines(sh.execute("FIND 1=carol")), vec!["(nil)"]);
        assert!(sh.store().index("by-1").is_some());
    }

    #[test]
    fn scan_global_and_by_key() {
        let sh = shell();
        assert_eq!(lines(sh.execute("SCAN")), vec!["(empty)"]);
        sh.execute("PUT 1=b");
        sh.execute("PUT 1=a");
        sh.execute("PUT 2=x");

        let all = lines(sh.execute("SCAN"));
        assert_eq!(all.len(), 4);
        assert_eq!(all[3], "(3 atoms)");

        let by_name = lines(sh.execute("SCAN 1"));
        assert_eq!(by_name, vec![r#"#1@2 {1="a"}"#, r#"#0@1 {1="b"}"#, "(2 atoms)"]);
    }

    #[test]
    fn usage_errors() {
        let sh = shell();
        assert!(lines(sh.execute("PUT")).concat().starts_with("ERR usage"));
        assert!(lines(sh.execute("PUT nonsense")).concat().starts_with("ERR bad junction"));
        assert!(lines(sh.execute("GET x")).concat().starts_with("ERR usage"));
        assert!(lines(sh.execute("SCAN x")).concat().starts_with("ERR usage"));
        assert_eq!(lines(sh.execute("FROB")), vec!["unknown command: FROB"]);
        assert!(lines(sh.execute("   ")).is_empty());
        assert_eq!(sh.execute("quit"), Reply::Exit);
    }

    #[test]
    fn read_only_store_rejects_put() {
        let sh = shell();
        sh.store().set_read_only(true).unwrap();
        assert!(lines(sh.execute("PUT 1=x")).concat().starts_with("ERR put failed"));
    }
}
