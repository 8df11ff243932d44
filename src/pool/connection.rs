use tokio::sync::OwnedSemaphorePermit;

use crate::error::Result;
use crate::nntp::NntpConnection;

use super::Pool;

/// An acquired, exclusively-owned connection. Returned to the pool's idle
/// stack on drop unless [`Lease::poison`] was called, in which case the
/// connection is destroyed instead (spec §4.1: a faulty connection must
/// never re-enter the idle stack).
pub struct Lease {
    pool: Pool,
    conn: Option<NntpConnection>,
    poisoned: bool,
    _local_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl Lease {
    pub(super) fn new(
        pool: Pool,
        conn: NntpConnection,
        local_permit: OwnedSemaphorePermit,
        global_permit: OwnedSemaphorePermit,
    ) -> Self {
        Lease {
            pool,
            conn: Some(conn),
            poisoned: false,
            _local_permit: local_permit,
            _global_permit: global_permit,
        }
    }

    /// Mark the underlying connection as unusable. The next drop destroys
    /// it rather than recycling it.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub async fn stat(&mut self, message_id: &str) -> Result<bool> {
        match self.conn_mut().stat(message_id).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_transient() => {
                self.poison();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn body(&mut self, message_id: &str) -> Result<Vec<u8>> {
        match self.conn_mut().body(message_id).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_transient() => {
                self.poison();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// See [`NntpConnection::body_prefix`]. Automatically poisons the
    /// lease when the read was truncated, since the socket can no longer
    /// start a fresh command.
    pub async fn body_prefix(&mut self, message_id: &str, max_bytes: usize) -> Result<Vec<u8>> {
        match self.conn_mut().body_prefix(message_id, max_bytes).await {
            Ok((bytes, truncated)) => {
                if truncated {
                    self.poison();
                }
                Ok(bytes)
            }
            Err(e) => {
                if e.is_transient() {
                    self.poison();
                }
                Err(e)
            }
        }
    }

    fn conn_mut(&mut self) -> &mut NntpConnection {
        self.conn.as_mut().expect("connection taken before lease dropped")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.poisoned {
                self.pool.destroy();
            } else {
                self.pool.release(conn);
            }
        }
    }
}
