use ahash::AHashMap as HashMap;
use crossbeam_channel as channel;
use futures::channel::oneshot;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::twopc::{XA_OK, XaError, XaResult, Xid};

/// The XA verbs that run on a branch's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Prepare,
    Commit { one_phase: bool },
    Rollback,
    Forget,
}

impl RequestType {
    /// Whether the branch worker is disposed of once this request completes.
    fn is_terminal(&self) -> bool {
        !matches!(self, RequestType::Prepare)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaRequest {
    pub kind: RequestType,
    pub xid: Xid,
}

impl XaRequest {
    pub fn new(kind: RequestType, xid: Xid) -> Self {
        Self { kind, xid }
    }
}

/// Executes requests on a branch worker.
pub trait XaRequestHandler: Send + Sync {
    /// Returns the XA return code of the verb (`XA_OK`, `XA_RDONLY`).
    fn handle(&self, request: &XaRequest) -> XaResult<i32>;
}

struct Envelope {
    request: XaRequest,
    reply: oneshot::Sender<XaResult<i32>>,
}

struct BranchWorker {
    mailbox: channel::Sender<Envelope>,
    handle: JoinHandle<()>,
}

/// Runs every XA request of one [`Xid`] on a dedicated worker thread.
///
/// Requests for the same branch are serialized in arrival order no matter
/// which thread submits them; the submitter blocks until the worker replies.
/// A branch's worker is disposed of after its commit, rollback or forget,
/// and after a prepare that ends the branch.
pub struct XaRequestProcessor {
    handler: Arc<dyn XaRequestHandler>,
    workers: Mutex<HashMap<Xid, BranchWorker>>,
}

impl XaRequestProcessor {
    pub fn new(handler: Arc<dyn XaRequestHandler>) -> Self {
        Self {
            handler,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Submits `request` to its branch worker and waits for the outcome.
    pub fn process(&self, request: XaRequest) -> XaResult<i32> {
        let xid = request.xid.clone();
        let terminal = request.kind.is_terminal();

        let mailbox = {
            let mut workers = self.workers.lock();
            match workers.get(&xid) {
                Some(worker) => worker.mailbox.clone(),
                None => {
                    let worker = self.spawn_worker(&xid)?;
                    let mailbox = worker.mailbox.clone();
                    workers.insert(xid.clone(), worker);
                    mailbox
                }
            }
        };

        let (reply, outcome) = oneshot::channel();
        mailbox
            .send(Envelope { request, reply })
            .map_err(|_| XaError::generic(format!("worker of {} is gone", xid)))?;
        drop(mailbox);

        let result = futures::executor::block_on(outcome)
            .map_err(|_| XaError::generic(format!("worker of {} dropped the request", xid)))
            .and_then(|outcome| outcome);

        // A prepare that did not leave the branch in doubt also completed it.
        if terminal || result != Ok(XA_OK) {
            self.dispose(&xid);
        }
        result
    }

    /// Number of live branch workers.
    pub fn active_workers(&self) -> usize {
        self.workers.lock().len()
    }

    fn spawn_worker(&self, xid: &Xid) -> XaResult<BranchWorker> {
        let (mailbox, requests) = channel::unbounded::<Envelope>();
        let handler = Arc::clone(&self.handler);
        let name = format!("xa-branch-{}", xid);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for envelope in requests.iter() {
                    let result = handler.handle(&envelope.request);
                    if envelope.reply.send(result).is_err() {
                        warn!("{}: requester went away before the reply", envelope.request.xid);
                    }
                }
            })
            .map_err(|e| XaError::generic(format!("cannot start {}: {}", name, e)))?;
        debug!("started worker for {}", xid);
        Ok(BranchWorker { mailbox, handle })
    }

    fn dispose(&self, xid: &Xid) {
        let worker = self.workers.lock().remove(xid);
        if let Some(BranchWorker { mailbox, handle }) = worker {
            drop(mailbox);
            if handle.join().is_err() {
                warn!("worker of {} panicked", xid);
            }
            debug!("disposed worker for {}", xid);
        }
    }
}

impl Drop for XaRequestProcessor {
    fn drop(&mut self) {
        for (_, BranchWorker { mailbox, handle }) in self.workers.get_mut().drain() {
            drop(mailbox);
            let _ = handle.join();
        }
    }
}
