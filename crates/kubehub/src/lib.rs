//! kwork kubehub: GVK resolution and the list/watch transport feeding the informer

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use kwork_core::{Delta, Object};
use tracing::{debug, info};

/// What to watch: one GVK, optionally narrowed to a namespace and selectors.
#[derive(Debug, Clone, Default)]
pub struct WatchTarget {
    /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
    pub gvk_key: String,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK to its served API resource and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Lift metadata out of a dynamic object. Type meta falls back to the resolved resource,
/// since list items often arrive without `apiVersion`/`kind`.
pub fn object_from_dynamic(obj: &DynamicObject, ar: &ApiResource) -> Result<Object> {
    let (api_version, kind) = match &obj.types {
        Some(t) if !t.kind.is_empty() => (t.api_version.clone(), t.kind.clone()),
        _ => (ar.api_version.clone(), ar.kind.clone()),
    };
    let meta = &obj.metadata;
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(Object {
        kind,
        api_version,
        namespace: meta.namespace.clone(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone(),
        resource_version: meta.resource_version.clone(),
        labels: meta.labels.clone().unwrap_or_default(),
        raw,
    })
}

fn delta_from(ev: Event<DynamicObject>, ar: &ApiResource) -> Result<Delta<Object>> {
    Ok(match ev {
        Event::Applied(o) => Delta::Applied(object_from_dynamic(&o, ar)?),
        Event::Deleted(o) => Delta::Deleted(object_from_dynamic(&o, ar)?),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            Delta::Restarted(list.iter().map(|o| object_from_dynamic(o, ar)).collect::<Result<Vec<_>>>()?)
        }
    })
}

/// List+watch `target` with the default kube client.
pub async fn watch_stream(target: &WatchTarget) -> Result<impl Stream<Item = Result<Delta<Object>>> + Send + 'static> {
    let client = Client::try_default().await.context("building kube client")?;
    watch_stream_with(client, target).await
}

/// List+watch `target`. The first item is a full listing; the stream re-lists and
/// re-watches with backoff after transport errors, yielding the error first.
pub async fn watch_stream_with(
    client: Client,
    target: &WatchTarget,
) -> Result<impl Stream<Item = Result<Delta<Object>>> + Send + 'static> {
    let gvk = parse_gvk_key(&target.gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match target.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        }
    } else {
        Api::all_with(client, &ar)
    };

    let mut cfg = watcher::Config::default();
    if let Some(sel) = target.label_selector.as_deref() {
        cfg = cfg.labels(sel);
    }
    if let Some(sel) = target.field_selector.as_deref() {
        cfg = cfg.fields(sel);
    }
    info!(gvk = %target.gvk_key, ns = ?target.namespace, namespaced, "watcher started");
    let stream = watcher::watcher(api, cfg)
        .default_backoff()
        .map(move |ev| delta_from(ev.context("watch stream")?, &ar));
    Ok(stream)
}
