//! Fortune database shared by peers under the distributed lock.
//!
//! Every peer of type [FORTUNE] keeps its own [Database] file.
//! A [FortuneServer] wraps each read and write in the critical section of
//! the distributed lock, so that at most one peer accesses its database at a time.
//!
//! The database file holds fortunes separated by lines consisting only of `%`:
//!
//! ```text
//! You will be hungry again in one hour.
//! %
//! A closed mouth gathers no feet.
//! %
//! ```

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, io::AsyncWriteExt, net::ToSocketAddrs, sync::Mutex};

use crate::{
    lock::LockError,
    member::{JoinError, Member, MemberVerb},
    name_service::NameServiceClient,
    rpc::{reply, Address, Args, CallError, Dispatch, ErrorKind, RemoteError, Stub, Verb},
    Cfg,
};

/// Peer type of fortune servers.
pub const FORTUNE: &str = "fortune";

/// Line separating two fortunes in the database file.
const SEPARATOR: &str = "%";

/// Database access failed.
#[derive(Debug)]
pub enum DatabaseError {
    /// Reading or appending to the database file failed.
    Io(io::Error),
    /// The fortune contains a separator line.
    InvalidFortune,
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "database file: {}", err),
            Self::InvalidFortune => write!(f, "fortune must not contain a line consisting of '{}'", SEPARATOR),
        }
    }
}

impl Error for DatabaseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::InvalidFortune => None,
        }
    }
}

impl From<io::Error> for DatabaseError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A file of fortunes, loaded into memory.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    fortunes: Mutex<Vec<String>>,
}

impl Database {
    /// Loads the database file.
    ///
    /// A missing file is treated as an empty database and created on the first write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let fortunes = match fs::read_to_string(&path).await {
            Ok(content) => parse(&content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        log::debug!("loaded {} fortunes from {}", fortunes.len(), path.display());
        Ok(Self { path, fortunes: Mutex::new(fortunes) })
    }

    /// A random fortune, or `None` if the database is empty.
    pub async fn read(&self) -> Option<String> {
        let fortunes = self.fortunes.lock().await;
        fortunes.choose(&mut rand::thread_rng()).cloned()
    }

    /// Appends a fortune to the database file.
    pub async fn write(&self, fortune: &str) -> Result<(), DatabaseError> {
        let fortune = fortune.trim_end_matches('\n');
        if fortune.lines().any(|line| line == SEPARATOR) {
            return Err(DatabaseError::InvalidFortune);
        }

        let mut fortunes = self.fortunes.lock().await;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(format!("{}\n{}\n", fortune, SEPARATOR).as_bytes()).await?;
        file.flush().await?;
        fortunes.push(fortune.to_string());
        Ok(())
    }

    /// Number of fortunes.
    pub async fn len(&self) -> usize {
        self.fortunes.lock().await.len()
    }

    /// Whether the database holds no fortunes.
    pub async fn is_empty(&self) -> bool {
        self.fortunes.lock().await.is_empty()
    }
}

/// Splits file content into fortunes.
///
/// Text after the last separator is kept as a fortune if it is not blank.
fn parse(content: &str) -> Vec<String> {
    let mut fortunes = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in content.lines() {
        if line == SEPARATOR {
            fortunes.push(current.join("\n"));
            current.clear();
        } else {
            current.push(line);
        }
    }
    if current.iter().any(|line| !line.trim().is_empty()) {
        fortunes.push(current.join("\n"));
    }
    fortunes
}

/// Reading or writing a fortune failed.
#[derive(Debug)]
pub enum FortuneError {
    /// The distributed lock was misused.
    Lock(LockError),
    /// The database failed.
    Database(DatabaseError),
}

impl fmt::Display for FortuneError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Lock(err) => write!(f, "lock: {}", err),
            Self::Database(err) => write!(f, "database: {}", err),
        }
    }
}

impl Error for FortuneError {}

impl From<LockError> for FortuneError {
    fn from(err: LockError) -> Self {
        Self::Lock(err)
    }
}

impl From<DatabaseError> for FortuneError {
    fn from(err: DatabaseError) -> Self {
        Self::Database(err)
    }
}

impl From<FortuneError> for RemoteError {
    fn from(err: FortuneError) -> Self {
        match err {
            FortuneError::Lock(err) => err.into(),
            FortuneError::Database(err) => RemoteError::new(ErrorKind::Database, err.to_string()),
        }
    }
}

/// Methods exposed by a fortune server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FortuneVerb {
    /// `read() -> string | null`
    Read,
    /// `write(fortune)`
    Write,
    /// Peer protocol.
    Member(MemberVerb),
}

impl Verb for FortuneVerb {
    fn parse(method: &str) -> Option<Self> {
        match method {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            other => MemberVerb::parse(other).map(Self::Member),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Member(verb) => verb.name(),
        }
    }
}

/// A member serving a fortune database.
#[derive(Debug)]
pub struct FortuneServer {
    member: Member,
    database: Database,
    /// Serializes the handlers of this server, which share one lock.
    turn: Mutex<()>,
}

impl FortuneServer {
    /// Starts a fortune server, serves it on `bind` and joins the other fortune servers.
    pub async fn join(
        cfg: Cfg, bind: impl ToSocketAddrs, name_service: NameServiceClient, database: Database,
    ) -> Result<Arc<Self>, JoinError> {
        let (member, skeleton) = Member::start(cfg, FORTUNE, bind, name_service).await?;
        let server = Arc::new(Self { member, database, turn: Mutex::new(()) });
        server.member.attach(skeleton.spawn(server.clone())).await;
        server.member.initialize().await?;
        Ok(server)
    }

    /// Reads a random fortune within the critical section.
    ///
    /// Concurrent callers on this server wait for their turn.
    pub async fn read(&self) -> Result<Option<String>, FortuneError> {
        let _turn = self.turn.lock().await;
        self.member.lock().acquire().await?;
        let fortune = self.database.read().await;
        self.member.lock().release().await?;
        Ok(fortune)
    }

    /// Appends a fortune within the critical section.
    pub async fn write(&self, fortune: &str) -> Result<(), FortuneError> {
        let _turn = self.turn.lock().await;
        self.member.lock().acquire().await?;
        let res = self.database.write(fortune).await;
        self.member.lock().release().await?;
        Ok(res?)
    }

    /// Leaves the network.
    pub async fn leave(&self) -> Result<(), CallError> {
        self.member.leave().await
    }

    /// The underlying member.
    pub fn member(&self) -> &Member {
        &self.member
    }

    /// The database of this server.
    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl Dispatch for FortuneServer {
    type Verb = FortuneVerb;

    async fn invoke(&self, verb: FortuneVerb, mut args: Args) -> Result<Value, RemoteError> {
        match verb {
            FortuneVerb::Read => reply(self.read().await?),
            FortuneVerb::Write => {
                let fortune: String = args.next("fortune")?;
                self.write(&fortune).await?;
                Ok(Value::Null)
            }
            FortuneVerb::Member(verb) => self.member.execute(verb, args).await,
        }
    }
}

/// Typed proxy of a remote [FortuneServer].
#[derive(Clone, Debug)]
pub struct FortuneClient {
    stub: Stub,
}

impl FortuneClient {
    /// Creates a client for the fortune server listening on `address`.
    pub fn new(address: Address, cfg: Cfg) -> Self {
        Self { stub: Stub::new(address, cfg) }
    }

    /// Reads a random fortune.
    pub async fn read(&self) -> Result<Option<String>, CallError> {
        self.stub.call_as(FortuneVerb::Read.name(), vec![]).await
    }

    /// Writes a new fortune.
    pub async fn write(&self, fortune: &str) -> Result<(), CallError> {
        self.stub.call(FortuneVerb::Write.name(), vec![json!(fortune)]).await?;
        Ok(())
    }
}
