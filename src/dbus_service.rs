//! Publishes the bus peer on the system D-Bus using the Victron `BusItem`
//! interface: one object per path plus a root object for bulk access and
//! change signals.

use crate::attribute_store::{AttributeEntry, AttributeValue, StoreError};
use crate::bus_peer::BusPeer;
use crate::change_notifier::ChangeBatch;
use anyhow::{bail, Context};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use zbus::fdo::{self, RequestNameFlags, RequestNameReply};
use zbus::zvariant::{OwnedValue, Value};
use zbus::{interface, Connection, SignalContext};

type ItemsDict = HashMap<String, HashMap<String, Value<'static>>>;

/// A single published path
struct BusItem {
    path: String,
    peer: BusPeer,
}

#[interface(name = "com.victronenergy.BusItem")]
impl BusItem {
    async fn get_value(&self) -> fdo::Result<Value<'static>> {
        let value = self.peer.get_value(&self.path).map_err(to_fdo)?;
        Ok(to_variant(&value))
    }

    async fn get_text(&self) -> fdo::Result<String> {
        self.peer.get_text(&self.path).map_err(to_fdo)
    }

    async fn set_value(&self, value: OwnedValue) -> fdo::Result<i32> {
        let value = from_variant(&value).ok_or_else(|| unsupported(&value))?;
        self.peer.set_value(&self.path, value).map_err(to_fdo)
    }
}

/// The `/` object: whole-device reads and writes, and the change signal
struct RootItem {
    peer: BusPeer,
}

#[interface(name = "com.victronenergy.BusItem")]
impl RootItem {
    async fn get_items(&self) -> fdo::Result<ItemsDict> {
        self.peer.get_items().map(|items| items_dict(&items)).map_err(to_fdo)
    }

    async fn get_value(&self) -> fdo::Result<HashMap<String, Value<'static>>> {
        let items = self.peer.get_items().map_err(to_fdo)?;
        Ok(items
            .iter()
            .map(|(path, entry)| (relative(path), to_variant(&entry.value)))
            .collect())
    }

    async fn get_text(&self) -> fdo::Result<HashMap<String, String>> {
        let items = self.peer.get_items().map_err(to_fdo)?;
        Ok(items
            .into_iter()
            .map(|(path, entry)| (relative(&path), entry.text.trim_matches('"').to_string()))
            .collect())
    }

    /// Writes several paths at once, keyed like `GetValue` output
    async fn set_value(&self, values: HashMap<String, OwnedValue>) -> fdo::Result<i32> {
        let mut converted = Vec::with_capacity(values.len());
        for (path, value) in &values {
            let value = from_variant(value).ok_or_else(|| unsupported(value))?;
            let path = absolute(path);
            // Nothing is written unless every path is published
            self.peer.get_value(&path).map_err(to_fdo)?;
            converted.push((path, value));
        }
        let mut status = crate::bus_peer::SET_VALUE_OK;
        for (path, value) in converted {
            status = self.peer.set_value(&path, value).map_err(to_fdo)?;
        }
        Ok(status)
    }

    #[zbus(signal)]
    async fn items_changed(ctxt: &SignalContext<'_>, changes: ItemsDict) -> zbus::Result<()>;
}

/// Registered D-Bus service. Dropping it closes the connection.
pub struct DbusService {
    connection: Connection,
    name: String,
}

impl DbusService {
    /// Connects to the system bus, exports every path and claims `name`.
    ///
    /// Fails if the bus is unreachable or another process already owns `name`.
    pub async fn start(name: &str, peer: BusPeer, paths: &[&str]) -> anyhow::Result<Self> {
        let connection = Connection::system()
            .await
            .context("failed to connect to system bus")?;

        for path in paths {
            tracing::debug!("Registering dbus path: {path}");
            connection
                .object_server()
                .at(
                    *path,
                    BusItem {
                        path: path.to_string(),
                        peer: peer.clone(),
                    },
                )
                .await
                .with_context(|| format!("failed to export {path}"))?;
        }
        connection
            .object_server()
            .at("/", RootItem { peer })
            .await
            .context("failed to export root object")?;

        match connection
            .request_name_with_flags(name, RequestNameFlags::DoNotQueue.into())
            .await
        {
            Ok(RequestNameReply::PrimaryOwner) | Ok(RequestNameReply::AlreadyOwner) => {}
            Ok(reply) => bail!("name {name} already taken on dbus ({reply:?})"),
            Err(zbus::Error::NameTaken) => bail!("name {name} already taken on dbus"),
            Err(e) => return Err(e).context("failed to request DBus name"),
        }

        Ok(Self {
            connection,
            name: name.to_string(),
        })
    }

    /// Forwards every change batch as one `ItemsChanged` signal on `/`
    pub fn spawn_publisher(&self, mut changes: UnboundedReceiver<ChangeBatch>) -> JoinHandle<()> {
        let connection = self.connection.clone();
        tokio::spawn(async move {
            while let Some(batch) = changes.recv().await {
                if let Err(e) = publish(&connection, &batch).await {
                    tracing::warn!("Failed to emit ItemsChanged for {} paths: {e}", batch.len());
                }
            }
            tracing::debug!("Change publisher exiting");
        })
    }

    pub async fn shutdown(self) {
        if let Err(e) = self.connection.release_name(self.name.as_str()).await {
            tracing::warn!("Failed to release {}: {e}", self.name);
        }
    }
}

async fn publish(connection: &Connection, batch: &ChangeBatch) -> zbus::Result<()> {
    let ctxt = SignalContext::new(connection, "/")?;
    RootItem::items_changed(&ctxt, items_dict(batch)).await
}

fn items_dict(items: &BTreeMap<String, AttributeEntry>) -> ItemsDict {
    items
        .iter()
        .map(|(path, entry)| {
            let item = HashMap::from([
                ("Value".to_string(), to_variant(&entry.value)),
                ("Text".to_string(), Value::from(entry.text.clone())),
            ]);
            (path.clone(), item)
        })
        .collect()
}

// Root level dictionaries use paths without the leading slash
fn relative(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

fn absolute(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

fn to_variant(value: &AttributeValue) -> Value<'static> {
    match value {
        AttributeValue::Double(v) => Value::F64(*v),
        AttributeValue::Int(v) => Value::I32(*v),
        AttributeValue::Text(v) => Value::from(v.clone()),
    }
}

fn from_variant(value: &Value<'_>) -> Option<AttributeValue> {
    let converted = match value {
        Value::F64(v) => AttributeValue::Double(*v),
        Value::I32(v) => AttributeValue::Int(*v),
        Value::I16(v) => AttributeValue::Int(i32::from(*v)),
        Value::U16(v) => AttributeValue::Int(i32::from(*v)),
        Value::U8(v) => AttributeValue::Int(i32::from(*v)),
        Value::Bool(v) => AttributeValue::Int(i32::from(*v)),
        Value::I64(v) => i32::try_from(*v)
            .map(AttributeValue::Int)
            .unwrap_or(AttributeValue::Double(*v as f64)),
        Value::U32(v) => i32::try_from(*v)
            .map(AttributeValue::Int)
            .unwrap_or(AttributeValue::Double(f64::from(*v))),
        Value::U64(v) => i32::try_from(*v)
            .map(AttributeValue::Int)
            .unwrap_or(AttributeValue::Double(*v as f64)),
        Value::Str(v) => AttributeValue::Text(v.as_str().to_string()),
        Value::Value(inner) => return from_variant(inner),
        _ => return None,
    };
    Some(converted)
}

fn unsupported(value: &Value<'_>) -> fdo::Error {
    fdo::Error::InvalidArgs(format!("unsupported value type {}", value.value_signature()))
}

fn to_fdo(error: StoreError) -> fdo::Error {
    match error {
        StoreError::NotInitialized => fdo::Error::Failed("Application not initialized".to_string()),
        StoreError::UnknownPath(path) => fdo::Error::UnknownObject(path),
    }
}
