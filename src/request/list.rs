//! Collections of requests completed together.

use std::thread;

use super::{Request, RequestId};
use crate::error::{Error, Result};
use crate::status::Status;

/// An owned set of in-flight requests.
///
/// Completion operations remove the requests they report, handing each one
/// back together with its status so received values can still be taken out of
/// it. A member that fails is removed too and its error is returned; members
/// that completed alongside it stay in the list.
///
/// Requests of every kind can be mixed; use
/// [`ReceiveRequest::into_request`](super::ReceiveRequest::into_request) or
/// `Into<Request>` to add typed receives.
#[derive(Debug, Default)]
pub struct RequestList {
    requests: Vec<Request>,
}

impl RequestList {
    /// Create an empty list.
    pub fn new() -> Self {
        RequestList::default()
    }

    /// Add a request and return its identity.
    pub fn add(&mut self, request: impl Into<Request>) -> RequestId {
        let request = request.into();
        let id = request.id();
        self.requests.push(request);
        id
    }

    /// Take a request back out of the list without completing it.
    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        let index = self.requests.iter().position(|r| r.id() == id)?;
        Some(self.requests.remove(index))
    }

    /// Number of requests in the list.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True if the list has no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Ids of the requests in the list, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().map(Request::id)
    }

    /// Test each request once and remove the first one found complete.
    pub fn test_any(&mut self) -> Result<Option<(Request, Status)>> {
        for index in 0..self.requests.len() {
            match self.requests[index].test() {
                Ok(None) => {}
                Ok(Some(status)) => return Ok(Some((self.requests.remove(index), status))),
                Err(err) => {
                    let failed = self.requests.remove(index);
                    tracing::debug!(request = %failed.id(), error = %err, "request list member failed");
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    /// Block until some request completes, then remove and return it.
    ///
    /// Fails with [`Error::EmptyRequestList`] if there is nothing to wait for.
    pub fn wait_any(&mut self) -> Result<(Request, Status)> {
        if self.requests.is_empty() {
            return Err(Error::EmptyRequestList);
        }
        loop {
            if let Some(done) = self.test_any()? {
                return Ok(done);
            }
            thread::yield_now();
        }
    }

    /// Remove and return every request, in the order they completed, once all
    /// have completed.
    ///
    /// An empty list completes immediately with no results. If a member
    /// fails, the members that already completed are put back in the list.
    pub fn wait_all(&mut self) -> Result<Vec<(Request, Status)>> {
        let mut done = Vec::with_capacity(self.requests.len());
        while !self.requests.is_empty() {
            match self.wait_any() {
                Ok(finished) => done.push(finished),
                Err(err) => {
                    self.requests.extend(done.into_iter().map(|(request, _)| request));
                    return Err(err);
                }
            }
        }
        Ok(done)
    }

    /// If every request has completed, remove and return them all in list order.
    ///
    /// Otherwise nothing is removed and `None` is returned; requests that did
    /// complete keep their cached status for the next call.
    pub fn test_all(&mut self) -> Result<Option<Vec<(Request, Status)>>> {
        let mut statuses = Vec::with_capacity(self.requests.len());
        for index in 0..self.requests.len() {
            match self.requests[index].test() {
                Ok(Some(status)) => statuses.push(status),
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.requests.remove(index);
                    return Err(err);
                }
            }
        }
        let requests = std::mem::take(&mut self.requests);
        Ok(Some(requests.into_iter().zip(statuses).collect()))
    }

    /// Remove and return whichever requests have completed, testing each once.
    ///
    /// If a member fails, only that member is removed; requests that completed
    /// in the same pass stay in the list with their cached status.
    pub fn test_some(&mut self) -> Result<Vec<(Request, Status)>> {
        let mut completed = Vec::new();
        for index in 0..self.requests.len() {
            match self.requests[index].test() {
                Ok(Some(status)) => completed.push((index, status)),
                Ok(None) => {}
                Err(err) => {
                    let failed = self.requests.remove(index);
                    tracing::debug!(request = %failed.id(), error = %err, "request list member failed");
                    return Err(err);
                }
            }
        }
        let mut done: Vec<_> = completed
            .into_iter()
            .rev()
            .map(|(index, status)| (self.requests.remove(index), status))
            .collect();
        done.reverse();
        Ok(done)
    }

    /// Block until at least one request completes, then remove and return
    /// every completed one.
    pub fn wait_some(&mut self) -> Result<Vec<(Request, Status)>> {
        if self.requests.is_empty() {
            return Err(Error::EmptyRequestList);
        }
        loop {
            let done = self.test_some()?;
            if !done.is_empty() {
                return Ok(done);
            }
            thread::yield_now();
        }
    }
}

impl Extend<Request> for RequestList {
    fn extend<I: IntoIterator<Item = Request>>(&mut self, iter: I) {
        self.requests.extend(iter);
    }
}

impl FromIterator<Request> for RequestList {
    fn from_iter<I: IntoIterator<Item = Request>>(iter: I) -> Self {
        RequestList {
            requests: iter.into_iter().collect(),
        }
    }
}
