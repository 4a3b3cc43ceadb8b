//! The per-key business logic seam.

use std::future::Future;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use kwork_core::{Key, MetaAccessor};
use tracing::info;

/// Reconciles one key against the cached state of its object.
///
/// The controller reads the cache right before each call and passes the result; `None`
/// means the object no longer exists and the handler should run its deletion path.
/// Calls for different keys may run concurrently, calls for one key never overlap.
/// Implementations must be idempotent: the same input may be delivered more than once.
#[async_trait::async_trait]
pub trait SyncHandler<O: MetaAccessor>: Send + Sync {
    async fn sync(&self, key: &Key, obj: Option<Arc<O>>) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`SyncHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F> { FnHandler(f) }

#[async_trait::async_trait]
impl<O, F, Fut> SyncHandler<O> for FnHandler<F>
where
    O: MetaAccessor,
    F: Fn(Key, Option<Arc<O>>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn sync(&self, key: &Key, obj: Option<Arc<O>>) -> anyhow::Result<()> {
        (self.0)(key.clone(), obj).await
    }
}

/// Prints object metadata on every sync and a notice when the object is gone.
pub struct PrintHandler<W> {
    kind: String,
    label: String,
    out: Mutex<W>,
}

impl PrintHandler<std::io::Stdout> {
    pub fn stdout(kind: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(kind, label, std::io::stdout())
    }
}

impl<W: Write + Send> PrintHandler<W> {
    /// `kind` names objects in deletion lines; `label` is the label key reported per sync.
    pub fn new(kind: impl Into<String>, label: impl Into<String>, out: W) -> Self {
        Self { kind: kind.into(), label: label.into(), out: Mutex::new(out) }
    }
}

#[async_trait::async_trait]
impl<O: MetaAccessor, W: Write + Send> SyncHandler<O> for PrintHandler<W> {
    async fn sync(&self, key: &Key, obj: Option<Arc<O>>) -> anyhow::Result<()> {
        let mut out = self.out.lock().map_err(|_| anyhow!("output lock poisoned"))?;
        match obj {
            None => writeln!(out, "{} {} does not exist anymore", self.kind, key)?,
            Some(o) => {
                info!("kind [{}], apiversion [{}]", o.kind(), o.api_version());
                info!(
                    "name [{}], namespace [{}], label {} [{}]",
                    o.name(),
                    o.namespace().unwrap_or(""),
                    self.label,
                    o.label(&self.label).unwrap_or("")
                );
                writeln!(out, "Sync/Add/Update for {} {}", o.kind(), o.name())?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwork_core::Object;

    #[derive(Clone, Default)]
    struct Buf(Arc<Mutex<Vec<u8>>>);

    impl Write for Buf {
        fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(b);
            Ok(b.len())
        }
        fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
    }

    impl Buf {
        fn text(&self) -> String { String::from_utf8(self.0.lock().unwrap().clone()).unwrap() }
    }

    #[tokio::test]
    async fn prints_sync_and_deletion_lines() {
        let buf = Buf::default();
        let h = PrintHandler::new("Pod", "app", buf.clone());
        let pod = Arc::new(Object::new("Pod", "v1", Some("ns"), "pod1").with_label("app", "web"));
        let key = Key::from("ns/pod1");

        SyncHandler::<Object>::sync(&h, &key, Some(pod.clone())).await.unwrap();
        SyncHandler::<Object>::sync(&h, &key, Some(pod)).await.unwrap();
        SyncHandler::<Object>::sync(&h, &key, None).await.unwrap();

        // unchanged input, identical output
        assert_eq!(
            buf.text(),
            "Sync/Add/Update for Pod pod1\nSync/Add/Update for Pod pod1\nPod ns/pod1 does not exist anymore\n"
        );
    }
}
