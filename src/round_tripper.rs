//! Round-tripper - per-request dispatch
//!
//! The single entry point for one parsed request: execute the semantically
//! correct sequence of backend operations and produce at most one response.
//! The round-tripper is stateless between requests; a connection carries
//! only its backend handle and the shared lock service.
//!
//! Commands that need a critical section spanning several backend
//! round-trips (`set`, `add`, `replace`, `cas`, `append`, `prepend`,
//! `incr`, `decr`) take the per-key advisory lock first and release it on
//! every exit path. Retrievals and deletes are single backend operations
//! and run unlocked.

use rand::Rng;
use tracing::{debug, warn};

use crate::keyspace::Keyspace;
use crate::lock::KeyLocks;
use crate::traits::{Record, RecordBackend, StoreError};
use crate::wire::{Command, Request, Response, Value, code};

/// What the connection loop should do after one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Response to write, if any (`None` under `noreply` or after `quit`)
    pub response: Option<Response>,
    /// Close the connection after writing
    pub close: bool,
}

impl Reply {
    fn send(response: Response) -> Self {
        Self {
            response: Some(response),
            close: false,
        }
    }

    fn silent() -> Self {
        Self {
            response: None,
            close: false,
        }
    }

    fn close() -> Self {
        Self {
            response: None,
            close: true,
        }
    }
}

/// Existence precondition of a store command
enum StoreGuard {
    /// `set` - store unconditionally
    Always,
    /// `add` - only onto a free key
    IfAbsent,
    /// `replace` - only over an existing record
    IfPresent,
    /// `cas` - only when the stored token matches the presented one
    IfTokenMatches,
}

/// Which end of the record a concat command touches
enum Splice {
    Append,
    Prepend,
}

/// Per-request dispatcher over one backend handle
#[derive(Clone)]
pub struct RoundTripper<B: Clone> {
    backend: B,
    keyspace: Keyspace,
    locks: KeyLocks<B>,
}

impl<B: RecordBackend + Clone> RoundTripper<B> {
    /// Build a dispatcher; the lock service shares the backend handle
    pub fn new(backend: B, keyspace: Keyspace) -> Self {
        let locks = KeyLocks::new(backend.clone());
        Self {
            backend,
            keyspace,
            locks,
        }
    }

    /// Perform one request and decide the reply
    ///
    /// `noreply` suppresses the response of any well-formed, dispatched
    /// command - success and semantic-error codes alike. Unknown commands
    /// always get their `ERROR` line back: the client is confused and
    /// needs to know.
    pub async fn round_trip(&self, request: Request) -> Reply {
        if let Command::Other(name) = &request.command {
            debug!(command = %name, "unknown command");
            return Reply::send(Response::error(format!("{name} not implemented")));
        }
        if request.command == Command::Quit {
            return Reply::close();
        }

        let response = match self.dispatch(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(command = ?request.command, cause = %err, "request failed");
                Response::server_error(err.to_string())
            }
        };

        if request.noreply {
            Reply::silent()
        } else {
            Reply::send(response)
        }
    }

    async fn dispatch(&self, request: &Request) -> Result<Response, StoreError> {
        match request.command {
            Command::Get => self.retrieve(request, false).await,
            Command::Gets => self.retrieve(request, true).await,
            Command::Set => self.store(request, &StoreGuard::Always).await,
            Command::Add => self.store(request, &StoreGuard::IfAbsent).await,
            Command::Replace => self.store(request, &StoreGuard::IfPresent).await,
            Command::Cas => self.store(request, &StoreGuard::IfTokenMatches).await,
            Command::Append => self.splice(request, &Splice::Append).await,
            Command::Prepend => self.splice(request, &Splice::Prepend).await,
            Command::Incr => self.arithmetic(request, true).await,
            Command::Decr => self.arithmetic(request, false).await,
            Command::Delete => self.delete(request).await,
            Command::Touch => self.touch(request).await,
            Command::Version => Ok(Response::status("VERSION 1")),
            Command::Quit | Command::Other(_) => unreachable!("handled before dispatch"),
        }
    }

    /// `get` / `gets`: unlocked per-key reads, missing keys skipped,
    /// always terminated by `END`
    async fn retrieve(&self, request: &Request, with_token: bool) -> Result<Response, StoreError> {
        let mut response = Response::default();
        for key in &request.keys {
            let Some(record) = self.backend.fetch(&self.keyspace.record_key(key)).await? else {
                continue;
            };
            response.values.push(Value {
                key: key.clone(),
                flags: record.flags,
                data: record.data,
                cas: with_token.then_some(record.token),
            });
        }
        response.status = code::END.to_string();
        Ok(response)
    }

    async fn store(&self, request: &Request, guard: &StoreGuard) -> Result<Response, StoreError> {
        let lock = self.locks.acquire(&self.keyspace.lock_key(request.key())).await?;
        let outcome = self.store_locked(request, guard).await;
        lock.release().await;
        outcome
    }

    async fn store_locked(
        &self,
        request: &Request,
        guard: &StoreGuard,
    ) -> Result<Response, StoreError> {
        let record_key = self.keyspace.record_key(request.key());

        match guard {
            StoreGuard::Always => {}
            StoreGuard::IfAbsent => {
                if self.backend.exists(&record_key).await? {
                    return Ok(Response::status(code::NOT_STORED));
                }
            }
            StoreGuard::IfPresent => {
                if !self.backend.exists(&record_key).await? {
                    return Ok(Response::status(code::NOT_STORED));
                }
            }
            StoreGuard::IfTokenMatches => {
                let Some(current) = self.backend.fetch(&record_key).await? else {
                    return Ok(Response::status(code::NOT_FOUND));
                };
                if current.token != request.cas {
                    return Ok(Response::status(code::EXISTS));
                }
            }
        }

        let record = Record {
            data: request.data.clone(),
            flags: request.flags.clone(),
            token: fresh_token(),
        };
        self.backend
            .store(&record_key, &record, request.exptime)
            .await?;
        Ok(Response::status(code::STORED))
    }

    /// `append` / `prepend`: read-modify-write under the lock, keeping
    /// flags and TTL
    async fn splice(&self, request: &Request, end: &Splice) -> Result<Response, StoreError> {
        let lock = self.locks.acquire(&self.keyspace.lock_key(request.key())).await?;
        let outcome = self.splice_locked(request, end).await;
        lock.release().await;
        outcome
    }

    async fn splice_locked(
        &self,
        request: &Request,
        end: &Splice,
    ) -> Result<Response, StoreError> {
        let record_key = self.keyspace.record_key(request.key());
        let Some(current) = self.backend.fetch(&record_key).await? else {
            return Ok(Response::status(code::NOT_STORED));
        };

        let mut data = Vec::with_capacity(current.data.len() + request.data.len());
        match end {
            Splice::Append => {
                data.extend_from_slice(&current.data);
                data.extend_from_slice(&request.data);
            }
            Splice::Prepend => {
                data.extend_from_slice(&request.data);
                data.extend_from_slice(&current.data);
            }
        }

        self.backend
            .rewrite(&record_key, &data, &fresh_token())
            .await?;
        Ok(Response::status(code::STORED))
    }

    /// `incr` / `decr`: decimal read-modify-write; `decr` clamps at zero
    async fn arithmetic(&self, request: &Request, increment: bool) -> Result<Response, StoreError> {
        let lock = self.locks.acquire(&self.keyspace.lock_key(request.key())).await?;
        let outcome = self.arithmetic_locked(request, increment).await;
        lock.release().await;
        outcome
    }

    async fn arithmetic_locked(
        &self,
        request: &Request,
        increment: bool,
    ) -> Result<Response, StoreError> {
        let record_key = self.keyspace.record_key(request.key());
        let Some(current) = self.backend.fetch(&record_key).await? else {
            return Ok(Response::status(code::NOT_FOUND));
        };

        let Some(value) = std::str::from_utf8(&current.data)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
        else {
            return Ok(Response::client_error(
                "cannot increment or decrement non-numeric value",
            ));
        };

        let next = if increment {
            value.saturating_add(request.delta)
        } else {
            value.saturating_sub(request.delta).max(0)
        };

        let text = next.to_string();
        self.backend
            .rewrite(&record_key, text.as_bytes(), &fresh_token())
            .await?;
        Ok(Response::status(text))
    }

    /// `delete`: one backend round-trip for all keys; the reply reflects
    /// how many were actually present
    async fn delete(&self, request: &Request) -> Result<Response, StoreError> {
        let backend_keys: Vec<String> = request
            .keys
            .iter()
            .map(|key| self.keyspace.record_key(key))
            .collect();
        let removed = self.backend.remove(&backend_keys).await?;
        if removed > 0 {
            Ok(Response::status(code::DELETED))
        } else {
            Ok(Response::status(code::NOT_FOUND))
        }
    }

    async fn touch(&self, request: &Request) -> Result<Response, StoreError> {
        let record_key = self.keyspace.record_key(request.key());
        let found = if request.exptime > 0 {
            self.backend.expire(&record_key, request.exptime).await?
        } else if self.backend.exists(&record_key).await? {
            self.backend.persist(&record_key).await?;
            true
        } else {
            false
        };
        if found {
            Ok(Response::status(code::TOUCHED))
        } else {
            Ok(Response::status(code::NOT_FOUND))
        }
    }
}

/// A fresh CAS token: random positive 63-bit integer as decimal text
///
/// Never derived from the value (predictable) or a counter (needs
/// coordination); uniqueness per store is what CAS relies on.
fn fresh_token() -> String {
    rand::thread_rng().gen_range(1..i64::MAX).to_string()
}
