//! local override database answering queries from statically loaded rules
//!
//! Rules are loaded once at startup from a plain text file, one rule per
//! line: `domain type target`. The table is immutable afterwards; a reload
//! builds a fresh table and swaps the shared handle.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derive_more::{Display, Error, From};
use parking_lot::RwLock;

use crate::dns::protocol::{DnsRecord, QueryType, TransientTtl};

/// CNAME chains in the rule file are followed at most this deep.
const MAX_CNAME_DEPTH: usize = 10;

#[derive(Debug, Display, From, Error)]
pub enum OverrideError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, OverrideError>;

/// Outcome of an override lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum OverrideResult {
    /// One or more matching rules produced these answers, in rule file
    /// order.
    Hit(Vec<DnsRecord>),
    /// The name is blackholed for the queried record type.
    Blackhole,
    /// No rule matched; the query goes to the cache or upstream.
    Miss,
}

/// Targets loaded for one domain, per record type, in file order.
#[derive(Clone, Debug, Default)]
struct RuleSet {
    a: Vec<Ipv4Addr>,
    aaaa: Vec<Ipv6Addr>,
    cname: Vec<String>,
    blackhole_a: bool,
    blackhole_aaaa: bool,
}

/// A parsed rule target, before it is filed under its domain.
enum RuleTarget {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    BlackholeA,
    BlackholeAaaa,
}

/// The immutable rule table built from one load of the rule file.
pub struct OverrideTable {
    exact: HashMap<String, RuleSet>,
    wildcard: HashMap<String, RuleSet>,
    internal_ids: HashMap<String, u32>,
    ttl: u32,
}

impl OverrideTable {
    fn empty(ttl: u32) -> OverrideTable {
        OverrideTable {
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            internal_ids: HashMap::new(),
            ttl,
        }
    }

    /// Load the rule file. Malformed lines are skipped with a warning;
    /// only I/O failures abort the load.
    pub fn load(path: &Path, ttl: u32) -> Result<OverrideTable> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut table = OverrideTable::empty(ttl);
        let mut loaded = 0;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 3 {
                log::warn!(
                    "{}:{}: expected 'domain type target', skipping",
                    path.display(),
                    lineno + 1
                );
                continue;
            }

            if table.insert_rule(parts[0], parts[1], parts[2]) {
                loaded += 1;
            } else {
                log::warn!("{}:{}: unparsable rule, skipping", path.display(), lineno + 1);
            }
        }

        log::info!("loaded {} override rules from {}", loaded, path.display());

        table.load_internal_ids(path);

        Ok(table)
    }

    fn insert_rule(&mut self, domain: &str, rtype: &str, target: &str) -> bool {
        let domain = normalize_name(domain);
        let blackhole = target.eq_ignore_ascii_case("blackhole");

        let parsed = match (rtype.to_ascii_uppercase().as_str(), blackhole) {
            ("A", true) => RuleTarget::BlackholeA,
            ("AAAA", true) => RuleTarget::BlackholeAaaa,
            ("A", false) => match target.parse::<Ipv4Addr>() {
                Ok(addr) => RuleTarget::A(addr),
                Err(_) => return false,
            },
            ("AAAA", false) => match target.parse::<Ipv6Addr>() {
                Ok(addr) => RuleTarget::Aaaa(addr),
                Err(_) => return false,
            },
            ("CNAME", false) => RuleTarget::Cname(normalize_name(target)),
            _ => return false,
        };

        let (key, rules) = if let Some(suffix) = domain.strip_prefix("*.") {
            (suffix.to_string(), &mut self.wildcard)
        } else {
            (domain, &mut self.exact)
        };
        let set = rules.entry(key).or_default();

        match parsed {
            RuleTarget::A(addr) => set.a.push(addr),
            RuleTarget::Aaaa(addr) => set.aaaa.push(addr),
            RuleTarget::Cname(host) => set.cname.push(host),
            RuleTarget::BlackholeA => set.blackhole_a = true,
            RuleTarget::BlackholeAaaa => set.blackhole_aaaa = true,
        }

        true
    }

    /// Read the optional internal ID table living next to the rule file.
    /// A missing table disables the feature; it is not an error.
    fn load_internal_ids(&mut self, rules_path: &Path) {
        let table_path = rules_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("id_conversion_table.txt");

        let file = match File::open(&table_path) {
            Ok(file) => file,
            Err(_) => {
                log::warn!(
                    "{} not found, internal id records disabled",
                    table_path.display()
                );
                return;
            }
        };

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("error reading {}: {}", table_path.display(), e);
                    return;
                }
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 2 {
                continue;
            }

            match parts[1].parse::<u32>() {
                Ok(id) => {
                    self.internal_ids.insert(normalize_name(parts[0]), id);
                }
                Err(_) => {
                    log::warn!(
                        "{}:{}: id '{}' is not an integer, skipping",
                        table_path.display(),
                        lineno + 1,
                        parts[1]
                    );
                }
            }
        }
    }

    /// Look up a query against the loaded rules.
    ///
    /// Matching precedence, first match wins:
    /// 1. exact domain with a target for the queried type
    /// 2. wildcard rules (`*.suffix`), longest suffix first
    /// 3. parent domain rules, longest suffix first
    pub fn query(&self, qname: &str, qtype: QueryType) -> OverrideResult {
        let qname = normalize_name(qname);

        if let Some(set) = self.exact.get(&qname) {
            if let Some(result) = self.answer_from(&qname, set, qtype) {
                return result;
            }
        }

        for suffix in proper_suffixes(&qname) {
            if let Some(set) = self.wildcard.get(suffix) {
                if let Some(result) = self.answer_from(&qname, set, qtype) {
                    return result;
                }
            }
        }

        for suffix in proper_suffixes(&qname) {
            if let Some(set) = self.exact.get(suffix) {
                if let Some(result) = self.answer_from(&qname, set, qtype) {
                    return result;
                }
            }
        }

        OverrideResult::Miss
    }

    /// The internal id assigned to a domain, if the id table lists one.
    pub fn internal_id(&self, qname: &str) -> Option<u32> {
        self.internal_ids.get(&normalize_name(qname)).cloned()
    }

    /// The TTL stamped on answers built from this table.
    pub fn answer_ttl(&self) -> u32 {
        self.ttl
    }

    fn answer_from(&self, qname: &str, set: &RuleSet, qtype: QueryType) -> Option<OverrideResult> {
        match qtype {
            QueryType::A => {
                if set.blackhole_a {
                    return Some(OverrideResult::Blackhole);
                }
                if !set.a.is_empty() {
                    let answers = set
                        .a
                        .iter()
                        .map(|addr| DnsRecord::A {
                            domain: qname.to_string(),
                            addr: *addr,
                            ttl: TransientTtl(self.ttl),
                        })
                        .collect();
                    return Some(OverrideResult::Hit(answers));
                }
                if !set.cname.is_empty() {
                    return Some(OverrideResult::Hit(self.chase_cname(qname, set, qtype)));
                }
                None
            }
            QueryType::Aaaa => {
                if set.blackhole_aaaa {
                    return Some(OverrideResult::Blackhole);
                }
                if !set.aaaa.is_empty() {
                    let answers = set
                        .aaaa
                        .iter()
                        .map(|addr| DnsRecord::Aaaa {
                            domain: qname.to_string(),
                            addr: *addr,
                            ttl: TransientTtl(self.ttl),
                        })
                        .collect();
                    return Some(OverrideResult::Hit(answers));
                }
                if !set.cname.is_empty() {
                    return Some(OverrideResult::Hit(self.chase_cname(qname, set, qtype)));
                }
                None
            }
            QueryType::Cname => {
                if !set.cname.is_empty() {
                    let answers = set
                        .cname
                        .iter()
                        .map(|host| DnsRecord::Cname {
                            domain: qname.to_string(),
                            host: host.clone(),
                            ttl: TransientTtl(self.ttl),
                        })
                        .collect();
                    return Some(OverrideResult::Hit(answers));
                }
                None
            }
            _ => None,
        }
    }

    /// Emit the CNAME record(s) for `qname` and, when the chain ends at a
    /// locally known address of the requested family, the address records
    /// as well. The CNAME always precedes the address it resolves to.
    fn chase_cname(&self, qname: &str, set: &RuleSet, qtype: QueryType) -> Vec<DnsRecord> {
        let mut answers: Vec<DnsRecord> = set
            .cname
            .iter()
            .map(|host| DnsRecord::Cname {
                domain: qname.to_string(),
                host: host.clone(),
                ttl: TransientTtl(self.ttl),
            })
            .collect();

        let mut current = set.cname[0].clone();
        for _ in 0..MAX_CNAME_DEPTH {
            let next = match self.exact.get(&current) {
                Some(next) => next,
                None => break,
            };

            match qtype {
                QueryType::A if !next.a.is_empty() => {
                    for addr in &next.a {
                        answers.push(DnsRecord::A {
                            domain: current.clone(),
                            addr: *addr,
                            ttl: TransientTtl(self.ttl),
                        });
                    }
                    break;
                }
                QueryType::Aaaa if !next.aaaa.is_empty() => {
                    for addr in &next.aaaa {
                        answers.push(DnsRecord::Aaaa {
                            domain: current.clone(),
                            addr: *addr,
                            ttl: TransientTtl(self.ttl),
                        });
                    }
                    break;
                }
                _ => {}
            }

            if next.cname.is_empty() {
                break;
            }

            let host = next.cname[0].clone();
            answers.push(DnsRecord::Cname {
                domain: current.clone(),
                host: host.clone(),
                ttl: TransientTtl(self.ttl),
            });
            current = host;
        }

        answers
    }
}

/// Shared handle to the current override table. Readers grab an `Arc` to
/// the table and drop the lock immediately; a reload swaps the pointer.
pub struct OverrideDb {
    table: RwLock<Arc<OverrideTable>>,
    path: PathBuf,
    ttl: u32,
}

impl OverrideDb {
    pub fn load(path: &Path, ttl: u32) -> Result<OverrideDb> {
        let table = OverrideTable::load(path, ttl)?;

        Ok(OverrideDb {
            table: RwLock::new(Arc::new(table)),
            path: path.to_path_buf(),
            ttl,
        })
    }

    /// The table as of now. Queries in flight keep using the table they
    /// grabbed even if a reload happens underneath them.
    pub fn current(&self) -> Arc<OverrideTable> {
        self.table.read().clone()
    }

    /// Rebuild the table from the rule file and swap it in.
    pub fn reload(&self) -> Result<()> {
        let fresh = OverrideTable::load(&self.path, self.ttl)?;
        *self.table.write() = Arc::new(fresh);

        Ok(())
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// Proper suffixes of a dotted name at label boundaries, longest first:
/// "a.b.c" yields "b.c", then "c".
fn proper_suffixes(name: &str) -> impl Iterator<Item = &str> {
    name.char_indices()
        .filter(|&(_, c)| c == '.')
        .map(|(i, _)| &name[i + 1..])
}
