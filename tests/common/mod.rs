//! An in-memory transport engine and SFTP server for driving connections
//! end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use sshmux::{
    sftp::{DirEntry, FileAttributes, Message, OpenFlags, Status, StatusCode},
    transport::{
        Authentication, Channel, ChannelCommand, ChannelEvent, ChannelPeer, ChannelRequest,
        Transport, TransportConfig, TransportError, TransportErrorKind, TransportLink,
    },
    ConnectionState, SshConnection,
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::watch;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthBehavior {
    Accept,
    Reject,
    Hang,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub refuse: bool,
    pub auth: AuthBehavior,
    pub sftp_version: u32,
    /// Directory entries returned per `readdir` page.
    pub page_size: usize,
    pub reject_subsystem: bool,
    /// Acknowledge channel opens but never answer a channel request.
    pub ignore_requests: bool,
    /// Delay before a channel open completes.
    pub open_delay: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            refuse: false,
            auth: AuthBehavior::Accept,
            sftp_version: 3,
            page_size: 2,
            reject_subsystem: false,
            ignore_requests: false,
            open_delay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(Vec<u8>),
    Dir,
    Link(Bytes),
}

/// The server's file table, shared by every channel and observable from tests.
#[derive(Debug)]
pub struct MemoryFs {
    /// Keyed by raw path, which need not be UTF-8.
    pub nodes: DashMap<Bytes, Node>,
    /// `(path, offset, len)` of every write request, in arrival order.
    pub writes: Mutex<Vec<(String, u64, usize)>>,
    /// Raw symlink arguments, in wire order.
    pub symlinks: Mutex<Vec<(String, String)>>,
    pub readdir_calls: AtomicUsize,
    /// Handles released by `close`.
    pub closes: AtomicUsize,
}

impl MemoryFs {
    fn new() -> Self {
        let nodes = DashMap::new();
        nodes.insert(Bytes::from_static(b"/"), Node::Dir);
        nodes.insert(Bytes::from_static(b"/home"), Node::Dir);
        Self {
            nodes,
            writes: Mutex::new(vec![]),
            symlinks: Mutex::new(vec![]),
            readdir_calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn file(&self, path: impl AsRef<[u8]>) -> Option<Vec<u8>> {
        match self.nodes.get(path.as_ref()).map(|node| node.value().clone()) {
            Some(Node::File(content)) => Some(content),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct MockTransport {
    pub settings: ServerSettings,
    pub fs: Arc<MemoryFs>,
    pub connects: AtomicUsize,
    /// Channels closed by the client, across every link.
    pub channel_closes: Arc<AtomicUsize>,
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockTransport {
    pub fn new(settings: ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            fs: Arc::new(MemoryFs::new()),
            connects: AtomicUsize::new(0),
            channel_closes: Arc::new(AtomicUsize::new(0)),
            links: Mutex::new(vec![]),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn channel_close_count(&self) -> usize {
        self.channel_closes.load(Ordering::SeqCst)
    }

    /// Tear down every link from the server side.
    pub fn drop_links(&self) {
        for link in self.links.lock().unwrap().iter() {
            link.closed.send_replace(true);
        }
    }

    pub fn links_closed(&self) -> bool {
        self.links
            .lock()
            .unwrap()
            .iter()
            .all(|link| *link.closed.borrow())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        config: TransportConfig,
    ) -> Result<Arc<dyn TransportLink>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.settings.refuse {
            return Err(TransportError::new(
                TransportErrorKind::ConnectionRefused,
                format!("{}:{} refused the connection", config.host, config.port),
            ));
        }
        let (closed, _) = watch::channel(false);
        let link = Arc::new(MockLink {
            settings: self.settings.clone(),
            fs: self.fs.clone(),
            channel_closes: self.channel_closes.clone(),
            closed,
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

#[derive(Debug)]
pub struct MockLink {
    settings: ServerSettings,
    fs: Arc<MemoryFs>,
    channel_closes: Arc<AtomicUsize>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl TransportLink for MockLink {
    async fn authenticate(&self) -> Result<(), TransportError> {
        match self.settings.auth {
            AuthBehavior::Accept => Ok(()),
            AuthBehavior::Reject => Err(TransportError::new(
                TransportErrorKind::AuthenticationFailed,
                "no more authentication methods",
            )),
            AuthBehavior::Hang => futures::future::pending().await,
        }
    }

    async fn open_channel(&self) -> Result<Channel, TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::new(TransportErrorKind::Closed, "link is closed"));
        }
        if let Some(delay) = self.settings.open_delay {
            tokio::time::sleep(delay).await;
        }
        let (channel, peer) = Channel::pair();
        tokio::spawn(serve_channel(
            peer,
            self.settings.clone(),
            self.fs.clone(),
            self.channel_closes.clone(),
        ));
        Ok(channel)
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn connection(transport: &Arc<MockTransport>) -> SshConnection {
    SshConnection::new(
        "example.com",
        22,
        Authentication::password("alice", "secret"),
        transport.clone(),
    )
}

pub async fn ready_connection(settings: ServerSettings) -> (Arc<MockTransport>, SshConnection) {
    let transport = MockTransport::new(settings);
    let connection = connection(&transport);
    connection.start(TIMEOUT).await.expect("failed to connect");
    (transport, connection)
}

/// Poll until `f` holds, failing the test after a while.
pub async fn eventually<F>(mut f: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

pub async fn wait_for_state(connection: &SshConnection, state: ConnectionState) {
    eventually(|| connection.state() == state).await
}

pub async fn with_timeout<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, f)
        .await
        .expect("the operation did not complete in time")
}

// ==== channel server ====

async fn serve_channel(
    mut peer: ChannelPeer,
    settings: ServerSettings,
    fs: Arc<MemoryFs>,
    closes: Arc<AtomicUsize>,
) {
    let mut sftp: Option<SftpServer> = None;
    let mut shell = false;

    while let Some(command) = peer.next_command().await {
        match command {
            ChannelCommand::Request(..) if settings.ignore_requests => {}
            ChannelCommand::Request(ChannelRequest::Exec { command, .. }) => {
                if !run_command(&peer, &command) {
                    return;
                }
            }
            ChannelCommand::Request(ChannelRequest::Shell { .. }) => {
                shell = true;
                peer.emit(ChannelEvent::Success);
            }
            ChannelCommand::Request(ChannelRequest::Subsystem { name, .. }) => {
                if name == "sftp" && !settings.reject_subsystem {
                    sftp = Some(SftpServer::new(settings.clone(), fs.clone()));
                    peer.emit(ChannelEvent::Success);
                } else {
                    peer.emit(ChannelEvent::Failure);
                }
            }
            ChannelCommand::Data(data) => {
                if let Some(server) = &mut sftp {
                    for response in server.receive(&data) {
                        peer.emit(ChannelEvent::Data(response));
                    }
                } else if shell {
                    if &data[..] == b"exit\n" {
                        // the remote end goes away on its own
                        peer.emit(ChannelEvent::Closed);
                        return;
                    }
                    peer.emit(ChannelEvent::Data(data));
                }
            }
            ChannelCommand::Close => {
                closes.fetch_add(1, Ordering::SeqCst);
                peer.emit(ChannelEvent::Closed);
                return;
            }
        }
    }
}

/// Play a canned script for `command`. Returns `false` once the channel is gone.
fn run_command(peer: &ChannelPeer, command: &str) -> bool {
    match command {
        "rejected" => {
            peer.emit(ChannelEvent::Failure);
            true
        }
        "sleep" => {
            peer.emit(ChannelEvent::Success);
            true
        }
        "echo hello" => {
            peer.emit(ChannelEvent::Success);
            peer.emit(ChannelEvent::Data(Bytes::from_static(b"hello\n")));
            peer.emit(ChannelEvent::ExitStatus(0));
            peer.emit(ChannelEvent::Eof);
            peer.emit(ChannelEvent::Closed);
            false
        }
        "false" => {
            peer.emit(ChannelEvent::Success);
            peer.emit(ChannelEvent::ExtendedData(Bytes::from_static(b"oops\n")));
            peer.emit(ChannelEvent::ExitStatus(1));
            peer.emit(ChannelEvent::Eof);
            peer.emit(ChannelEvent::Closed);
            false
        }
        "quiet" => {
            peer.emit(ChannelEvent::Success);
            peer.emit(ChannelEvent::Eof);
            peer.emit(ChannelEvent::Closed);
            false
        }
        _ => {
            // dies without a word
            peer.emit(ChannelEvent::Success);
            peer.emit(ChannelEvent::Closed);
            false
        }
    }
}

// ==== SFTP server ====

enum OpenHandle {
    File(Bytes),
    Dir(Vec<DirEntry>),
}

struct SftpServer {
    settings: ServerSettings,
    fs: Arc<MemoryFs>,
    buf: BytesMut,
    handles: HashMap<Bytes, OpenHandle>,
    next_handle: usize,
}

impl SftpServer {
    fn new(settings: ServerSettings, fs: Arc<MemoryFs>) -> Self {
        Self {
            settings,
            fs,
            buf: BytesMut::new(),
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn receive(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut responses = vec![];
        while self.buf.len() >= 4 {
            let len = (&self.buf[..4]).get_u32() as usize;
            if self.buf.len() < 4 + len {
                break;
            }
            self.buf.advance(4);
            let frame = self.buf.split_to(len).freeze();
            let request = Message::decode(frame).expect("the client sent a malformed frame");
            responses.push(self.respond(request).to_frame());
        }
        responses
    }

    fn new_handle(&mut self, handle: OpenHandle) -> Bytes {
        self.next_handle += 1;
        let mut name = BytesMut::new();
        name.put_slice(format!("handle-{}", self.next_handle).as_bytes());
        let name = name.freeze();
        self.handles.insert(name.clone(), handle);
        name
    }

    fn respond(&mut self, request: Message) -> Message {
        match request {
            Message::Init { .. } => Message::Version {
                version: self.settings.sftp_version,
                extensions: vec![("posix-rename@openssh.com".into(), "1".into())],
            },
            Message::Realpath { id, path } => {
                name(id, vec![entry(normalize(&path), FileAttributes::default())])
            }
            Message::Mkdir { id, path, .. } => {
                if self.fs.nodes.contains_key(&path) {
                    return status(id, StatusCode::Failure);
                }
                if !self.is_dir(parent(&path)) {
                    return status(id, StatusCode::NoSuchFile);
                }
                self.fs.nodes.insert(path, Node::Dir);
                status(id, StatusCode::Ok)
            }
            Message::Rmdir { id, path } => {
                if !self.is_dir(&path) {
                    return status(id, StatusCode::NoSuchFile);
                }
                if !self.children(&path).is_empty() {
                    return status(id, StatusCode::Failure);
                }
                self.fs.nodes.remove(&path);
                status(id, StatusCode::Ok)
            }
            Message::Open {
                id,
                filename,
                pflags,
                ..
            } => {
                let existing = self.fs.nodes.get(&filename).map(|node| node.value().clone());
                match existing {
                    Some(Node::File(..)) if pflags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) => {
                        return status(id, StatusCode::Failure)
                    }
                    Some(Node::File(..)) => {
                        if pflags.contains(OpenFlags::TRUNCATE) {
                            self.fs.nodes.insert(filename.clone(), Node::File(vec![]));
                        }
                    }
                    Some(..) => return status(id, StatusCode::Failure),
                    None if pflags.contains(OpenFlags::CREATE) && self.is_dir(parent(&filename)) => {
                        self.fs.nodes.insert(filename.clone(), Node::File(vec![]));
                    }
                    None => return status(id, StatusCode::NoSuchFile),
                }
                let handle = self.new_handle(OpenHandle::File(filename));
                Message::Handle { id, handle }
            }
            Message::Close { id, handle } => match self.handles.remove(&handle) {
                Some(..) => {
                    self.fs.closes.fetch_add(1, Ordering::SeqCst);
                    status(id, StatusCode::Ok)
                }
                None => status(id, StatusCode::Failure),
            },
            Message::Read {
                id,
                handle,
                offset,
                len,
            } => {
                let content = match self.handles.get(&handle) {
                    Some(OpenHandle::File(path)) => self.fs.file(path).unwrap_or_default(),
                    _ => return status(id, StatusCode::Failure),
                };
                let start = offset as usize;
                if start >= content.len() {
                    return status(id, StatusCode::Eof);
                }
                let end = content.len().min(start + len as usize);
                Message::Data {
                    id,
                    data: Bytes::copy_from_slice(&content[start..end]),
                }
            }
            Message::Write {
                id,
                handle,
                offset,
                data,
            } => {
                let path = match self.handles.get(&handle) {
                    Some(OpenHandle::File(path)) => path.clone(),
                    _ => return status(id, StatusCode::Failure),
                };
                self.fs
                    .writes
                    .lock()
                    .unwrap()
                    .push((text(&path), offset, data.len()));
                let mut content = self.fs.file(&path).unwrap_or_default();
                let end = offset as usize + data.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset as usize..end].copy_from_slice(&data);
                self.fs.nodes.insert(path, Node::File(content));
                status(id, StatusCode::Ok)
            }
            Message::Opendir { id, path } => {
                if !self.is_dir(&path) {
                    return status(id, StatusCode::NoSuchFile);
                }
                let mut entries = vec![
                    entry(Bytes::from_static(b"."), FileAttributes::default()),
                    entry(Bytes::from_static(b".."), FileAttributes::default()),
                ];
                for child in self.children(&path) {
                    let attrs = self.attributes(&child).unwrap_or_default();
                    let start = child.iter().rposition(|&b| b == b'/').map_or(0, |i| i + 1);
                    entries.push(entry(child.slice(start..), attrs));
                }
                let handle = self.new_handle(OpenHandle::Dir(entries));
                Message::Handle { id, handle }
            }
            Message::Readdir { id, handle } => {
                self.fs.readdir_calls.fetch_add(1, Ordering::SeqCst);
                let page_size = self.settings.page_size;
                match self.handles.get_mut(&handle) {
                    Some(OpenHandle::Dir(remaining)) if remaining.is_empty() => {
                        status(id, StatusCode::Eof)
                    }
                    Some(OpenHandle::Dir(remaining)) => {
                        let take = remaining.len().min(page_size);
                        let entries = remaining.drain(..take).collect();
                        name(id, entries)
                    }
                    _ => status(id, StatusCode::Failure),
                }
            }
            Message::Stat { id, path } | Message::Lstat { id, path } => {
                match self.attributes(&path) {
                    Some(attrs) => Message::Attrs { id, attrs },
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            Message::Fstat { id, handle } => {
                let attrs = match self.handles.get(&handle) {
                    Some(OpenHandle::File(path)) => self.attributes(path),
                    _ => None,
                };
                match attrs {
                    Some(attrs) => Message::Attrs { id, attrs },
                    None => status(id, StatusCode::Failure),
                }
            }
            Message::Setstat { id, path, .. } => {
                if self.fs.nodes.contains_key(&path) {
                    status(id, StatusCode::Ok)
                } else {
                    status(id, StatusCode::NoSuchFile)
                }
            }
            Message::Fsetstat { id, .. } => status(id, StatusCode::Ok),
            Message::Remove { id, filename } => match self.fs.file(&filename) {
                Some(..) => {
                    self.fs.nodes.remove(&filename);
                    status(id, StatusCode::Ok)
                }
                None => status(id, StatusCode::NoSuchFile),
            },
            Message::Rename {
                id,
                oldpath,
                newpath,
            } => {
                if self.fs.nodes.contains_key(&newpath) {
                    return status(id, StatusCode::Failure);
                }
                match self.fs.nodes.remove(&oldpath) {
                    Some((_, node)) => {
                        self.fs.nodes.insert(newpath, node);
                        status(id, StatusCode::Ok)
                    }
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            Message::Symlink {
                id,
                linkpath: first,
                targetpath: second,
            } => {
                self.fs
                    .symlinks
                    .lock()
                    .unwrap()
                    .push((text(&first), text(&second)));
                // like OpenSSH, the target comes first on the wire
                self.fs.nodes.insert(second, Node::Link(first));
                status(id, StatusCode::Ok)
            }
            Message::Readlink { id, path } => {
                match self.fs.nodes.get(&path).map(|node| node.value().clone()) {
                    Some(Node::Link(target)) => name(id, vec![entry(target, FileAttributes::default())]),
                    _ => status(id, StatusCode::NoSuchFile),
                }
            }
            request => {
                let id = request.request_id().unwrap_or_default();
                status(id, StatusCode::OpUnsupported)
            }
        }
    }

    fn is_dir(&self, path: &[u8]) -> bool {
        matches!(self.fs.nodes.get(path).map(|node| node.value().clone()), Some(Node::Dir))
    }

    fn children(&self, dir: &[u8]) -> Vec<Bytes> {
        let mut prefix = dir.to_vec();
        if dir != b"/" {
            prefix.push(b'/');
        }
        let mut children: Vec<Bytes> = self
            .fs
            .nodes
            .iter()
            .map(|node| node.key().clone())
            .filter(|path| {
                path.len() > prefix.len()
                    && path.starts_with(&prefix)
                    && !path[prefix.len()..].contains(&b'/')
            })
            .collect();
        children.sort();
        children
    }

    fn attributes(&self, path: &[u8]) -> Option<FileAttributes> {
        let node = self.fs.nodes.get(path).map(|node| node.value().clone())?;
        let attrs = match node {
            Node::File(content) => FileAttributes {
                size: Some(content.len() as u64),
                permissions: Some(0o100644),
                ..Default::default()
            },
            Node::Dir => FileAttributes {
                permissions: Some(0o040755),
                ..Default::default()
            },
            Node::Link(..) => FileAttributes {
                permissions: Some(0o120777),
                ..Default::default()
            },
        };
        Some(attrs)
    }
}

fn normalize(path: &[u8]) -> Bytes {
    if path.is_empty() || path == b"." {
        return Bytes::from_static(b"/home");
    }
    let mut end = path.len();
    while end > 1 && path[end - 1] == b'/' {
        end -= 1;
    }
    Bytes::copy_from_slice(&path[..end])
}

fn parent(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(0) | None => b"/",
        Some(index) => &path[..index],
    }
}

fn text(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

fn entry(filename: Bytes, attrs: FileAttributes) -> DirEntry {
    DirEntry {
        longname: text(&filename),
        filename,
        attrs,
    }
}

fn name(id: u32, entries: Vec<DirEntry>) -> Message {
    Message::Name { id, entries }
}

fn status(id: u32, code: StatusCode) -> Message {
    Message::Status {
        id,
        status: Status::new(code, format!("{:?}", code)),
    }
}
