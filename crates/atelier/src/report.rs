//! JSON rendering of the filtered views.

use miette::Result;
use serde::Serialize;
use serde_json::{Map, Value};

use atelier_sync::{
    Absence, CacheStore, Client, Holiday, Project, ProjectMember, Stored, Task, TimesheetEntry,
    User, visible,
};

fn view<T: Stored + Serialize>(
    out: &mut Map<String, Value>,
    store: &CacheStore,
) -> Result<(), serde_json::Error> {
    let rows = visible(store.collection::<T>());
    out.insert(T::TABLE.name().to_string(), serde_json::to_value(rows)?);
    Ok(())
}

/// Every collection's visible rows, keyed by table name.
pub fn views_json(store: &CacheStore) -> Result<Value, serde_json::Error> {
    let mut out = Map::new();
    view::<Client>(&mut out, store)?;
    view::<Project>(&mut out, store)?;
    view::<Task>(&mut out, store)?;
    view::<TimesheetEntry>(&mut out, store)?;
    view::<ProjectMember>(&mut out, store)?;
    view::<Absence>(&mut out, store)?;
    view::<Holiday>(&mut out, store)?;
    view::<User>(&mut out, store)?;
    Ok(Value::Object(out))
}

/// Print the views to stdout as pretty JSON.
pub fn print(store: &CacheStore) -> Result<()> {
    let json = views_json(store).map_err(|e| miette::miette!("failed to render views: {}", e))?;
    let text = serde_json::to_string_pretty(&json)
        .map_err(|e| miette::miette!("failed to render views: {}", e))?;
    println!("{text}");
    Ok(())
}
