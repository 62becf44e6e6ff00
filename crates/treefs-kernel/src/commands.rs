//! Command layer.
//!
//! Parses the user-facing verbs and runs them against a repository on
//! behalf of one session. The session owns the current folder as a node ID,
//! so `pwd` follows the folder when it is moved. Relative paths are joined
//! onto the current folder's path before resolution.
//!
//! Repository calls are synchronous and may wait on locks or the store, so
//! [`Session::execute`] runs them on the blocking pool.

use std::sync::Arc;

use treefs_types::{NodeId, NodeStat, NodeSummary};

use crate::error::{TreeError, TreeResult};
use crate::integrity::Violation;
use crate::path::{NodePath, RelativePath};
use crate::repo::{SearchHit, SharedRepository, TreeRepository};

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Cd { path: Option<String> },
    Pwd,
    Cr {
        parents: bool,
        path: String,
        data: Option<String>,
    },
    Cat { path: String },
    Ls { path: Option<String>, long: bool },
    Find { name: String, path: Option<String> },
    Mv {
        path: String,
        dest: String,
        new_name: Option<String>,
    },
    Rm { paths: Vec<String> },
    Up {
        path: String,
        name: String,
        data: Option<String>,
    },
    Stat { path: String },
    Fsck,
}

const USAGE: &str = "commands: cd [path] | pwd | cr [-p] path [data] | cat path | ls [-l] [path] | \
find name [path] | mv path dest [new_name] | rm path... | up path name [data] | stat path | fsck";

impl Command {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> TreeResult<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }
        let words = split_words(trimmed)?;
        Self::from_args(&words).map(Some)
    }

    /// Build from already-split words, verb first.
    pub fn from_args(words: &[String]) -> TreeResult<Self> {
        let Some((verb, rest)) = words.split_first() else {
            return Err(TreeError::invalid(USAGE));
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();
        let usage = |form: &str| TreeError::invalid(format!("usage: {form}"));

        let command = match (verb.as_str(), args.as_slice()) {
            ("cd", []) => Command::Cd { path: None },
            ("cd", [path]) => Command::Cd {
                path: Some(path.to_string()),
            },
            ("cd", _) => return Err(usage("cd [path]")),

            ("pwd", []) => Command::Pwd,
            ("pwd", _) => return Err(usage("pwd")),

            ("cr", _) => {
                let (parents, rest) = match args.as_slice() {
                    ["-p" | "--parents", rest @ ..] => (true, rest),
                    rest => (false, rest),
                };
                match rest {
                    [path] => Command::Cr {
                        parents,
                        path: path.to_string(),
                        data: None,
                    },
                    [path, data] => Command::Cr {
                        parents,
                        path: path.to_string(),
                        data: Some(data.to_string()),
                    },
                    _ => return Err(usage("cr [-p] path [data]")),
                }
            }

            ("cat", [path]) => Command::Cat {
                path: path.to_string(),
            },
            ("cat", _) => return Err(usage("cat path")),

            ("ls", _) => {
                let (long, rest) = match args.as_slice() {
                    ["-l", rest @ ..] => (true, rest),
                    rest => (false, rest),
                };
                match rest {
                    [] => Command::Ls { path: None, long },
                    [path] => Command::Ls {
                        path: Some(path.to_string()),
                        long,
                    },
                    _ => return Err(usage("ls [-l] [path]")),
                }
            }

            ("find", [name]) => Command::Find {
                name: name.to_string(),
                path: None,
            },
            ("find", [name, path]) => Command::Find {
                name: name.to_string(),
                path: Some(path.to_string()),
            },
            ("find", _) => return Err(usage("find name [path]")),

            ("mv", [path, dest]) => Command::Mv {
                path: path.to_string(),
                dest: dest.to_string(),
                new_name: None,
            },
            ("mv", [path, dest, new_name]) => Command::Mv {
                path: path.to_string(),
                dest: dest.to_string(),
                new_name: Some(new_name.to_string()),
            },
            ("mv", _) => return Err(usage("mv path dest [new_name]")),

            ("rm", []) => return Err(usage("rm path...")),
            ("rm", paths) => Command::Rm {
                paths: paths.iter().map(|p| p.to_string()).collect(),
            },

            ("up", [path, name]) => Command::Up {
                path: path.to_string(),
                name: name.to_string(),
                data: None,
            },
            ("up", [path, name, data]) => Command::Up {
                path: path.to_string(),
                name: name.to_string(),
                data: Some(data.to_string()),
            },
            ("up", _) => return Err(usage("up path name [data]")),

            ("stat", [path]) => Command::Stat {
                path: path.to_string(),
            },
            ("stat", _) => return Err(usage("stat path")),

            ("fsck", []) => Command::Fsck,
            ("fsck", _) => return Err(usage("fsck")),

            (other, _) => {
                return Err(TreeError::invalid(format!("unknown command: {other}; {USAGE}")));
            }
        };
        Ok(command)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Cd { .. } => "cd",
            Command::Pwd => "pwd",
            Command::Cr { .. } => "cr",
            Command::Cat { .. } => "cat",
            Command::Ls { .. } => "ls",
            Command::Find { .. } => "find",
            Command::Mv { .. } => "mv",
            Command::Rm { .. } => "rm",
            Command::Up { .. } => "up",
            Command::Stat { .. } => "stat",
            Command::Fsck => "fsck",
        }
    }
}

/// Split a line into words.
///
/// Whitespace separates words. Single quotes are literal; double quotes
/// allow `\"` and `\\`; a backslash outside quotes escapes the next char.
pub fn split_words(line: &str) -> TreeResult<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(TreeError::invalid("unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(TreeError::invalid("unterminated double quote")),
                        },
                        Some(c) => word.push(c),
                        None => return Err(TreeError::invalid("unterminated double quote")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => word.push(c),
                    None => return Err(TreeError::invalid("trailing backslash")),
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// `cd`, `pwd`: the session folder's path.
    Cwd(NodePath),
    Created { id: NodeId, path: NodePath },
    Content(Vec<u8>),
    Listing(Vec<NodeSummary>),
    /// `ls -l`: the folder itself, then each child.
    LongListing {
        folder: NodeStat,
        children: Vec<NodeStat>,
    },
    Matches(Vec<SearchHit>),
    Removed(usize),
    Stat(NodeStat),
    Report(Vec<Violation>),
    Done,
}

/// One caller's view of the tree.
pub struct Session {
    repo: SharedRepository,
    cwd: NodeId,
}

impl Session {
    /// New session positioned at the root.
    pub fn new(repo: SharedRepository) -> Self {
        let cwd = repo.root_id();
        Self { repo, cwd }
    }

    pub fn repo(&self) -> &SharedRepository {
        &self.repo
    }

    /// Current folder.
    pub fn cwd(&self) -> NodeId {
        self.cwd
    }

    /// Parse and run one line. Blank lines and comments yield `None`.
    pub async fn execute_line(&mut self, line: &str) -> TreeResult<Option<Output>> {
        match Command::parse(line)? {
            Some(command) => self.execute(command).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run a command on the blocking pool.
    pub async fn execute(&mut self, command: Command) -> TreeResult<Output> {
        let repo = Arc::clone(&self.repo);
        let cwd = self.cwd;
        let verb = command.verb();
        let (output, next_cwd) = tokio::task::spawn_blocking(move || run(&repo, cwd, command))
            .await
            .map_err(|e| TreeError::other(format!("spawn_blocking: {e}")))??;
        if let Some(id) = next_cwd {
            self.cwd = id;
        }
        tracing::debug!(verb, "command done");
        Ok(output)
    }
}

/// Absolute form of a user path, relative ones taken from `cwd`.
fn absolute(repo: &TreeRepository, cwd: NodeId, raw: &str) -> TreeResult<NodePath> {
    let rel = RelativePath::parse(raw)?;
    if rel.absolute {
        return NodePath::parse(raw);
    }
    Ok(repo.path_of(cwd)?.resolve(&rel))
}

fn run(repo: &TreeRepository, cwd: NodeId, command: Command) -> TreeResult<(Output, Option<NodeId>)> {
    let output = match command {
        Command::Cd { path } => {
            let target = match path {
                Some(raw) => absolute(repo, cwd, &raw)?,
                None => NodePath::root(),
            };
            let id = repo.resolve_folder(&target)?;
            return Ok((Output::Cwd(target), Some(id)));
        }
        Command::Pwd => Output::Cwd(repo.path_of(cwd)?),
        Command::Cr {
            parents,
            path,
            data,
        } => {
            let path = absolute(repo, cwd, &path)?;
            let id = repo.create_at(&path, data.map(String::into_bytes), parents)?;
            Output::Created { id, path }
        }
        Command::Cat { path } => Output::Content(repo.read(&absolute(repo, cwd, &path)?)?),
        Command::Ls { path, long } => {
            let path = match path {
                Some(raw) => absolute(repo, cwd, &raw)?,
                None => repo.path_of(cwd)?,
            };
            if long {
                let (folder, children) = repo.list_stats(&path)?;
                Output::LongListing { folder, children }
            } else {
                Output::Listing(repo.list(&path)?)
            }
        }
        Command::Find { name, path } => {
            let root = path.map(|raw| absolute(repo, cwd, &raw)).transpose()?;
            Output::Matches(repo.search(&name, root.as_ref(), None)?)
        }
        Command::Mv {
            path,
            dest,
            new_name,
        } => {
            let src = absolute(repo, cwd, &path)?;
            let dst = absolute(repo, cwd, &dest)?;
            repo.move_node(&src, &dst, new_name.as_deref())?;
            Output::Done
        }
        Command::Rm { paths } => {
            let paths = paths
                .iter()
                .map(|raw| absolute(repo, cwd, raw))
                .collect::<TreeResult<Vec<_>>>()?;
            Output::Removed(repo.remove(&paths)?)
        }
        Command::Up { path, name, data } => {
            let path = absolute(repo, cwd, &path)?;
            repo.update(&path, Some(&name), data.map(String::into_bytes))?;
            Output::Done
        }
        Command::Stat { path } => Output::Stat(repo.stat(&absolute(repo, cwd, &path)?)?),
        Command::Fsck => Output::Report(repo.verify()?),
    };
    Ok((output, None))
}
