//! Dataset operations for MockTrueNasClient

use super::{MockTrueNasClient, lock, rpc_error};
use crate::error::TrueNasError;
use crate::models::*;

pub fn get_dataset(client: &MockTrueNasClient, path: &str) -> Result<Option<Dataset>, TrueNasError> {
    client.record("pool.dataset.query", path)?;
    Ok(lock(&client.datasets).get(path).cloned())
}

pub fn query_datasets(client: &MockTrueNasClient, kind: Option<DatasetType>) -> Result<Vec<Dataset>, TrueNasError> {
    client.record("pool.dataset.query", "*")?;
    Ok(lock(&client.datasets)
        .values()
        .filter(|d| kind.is_none_or(|k| d.kind == k))
        .cloned()
        .collect())
}

pub fn create_dataset(client: &MockTrueNasClient, request: &CreateDatasetRequest) -> Result<Dataset, TrueNasError> {
    client.record("pool.dataset.create", &request.name)?;
    {
        let datasets = lock(&client.datasets);
        if datasets.contains_key(&request.name) {
            return Err(rpc_error(
                "pool.dataset.create",
                "EEXIST",
                format!("{} already exists", request.name),
            ));
        }
        let Some((parent, _)) = request.name.rsplit_once('/') else {
            return Err(rpc_error(
                "pool.dataset.create",
                "EINVAL",
                format!("{} is a pool, not a dataset", request.name),
            ));
        };
        match datasets.get(parent) {
            Some(p) if !p.is_volume() => {}
            Some(_) => {
                return Err(rpc_error(
                    "pool.dataset.create",
                    "EINVAL",
                    format!("parent {parent} is a volume"),
                ));
            }
            None => {
                return Err(rpc_error(
                    "pool.dataset.create",
                    "ENOENT",
                    format!("parent {parent} does not exist"),
                ));
            }
        }
    }
    Ok(client.insert_dataset(&request.name, request.kind, request.volsize))
}

pub fn delete_dataset(
    client: &MockTrueNasClient,
    path: &str,
    recursive: bool,
    _force: bool,
) -> Result<(), TrueNasError> {
    client.record("pool.dataset.delete", path)?;
    let mut datasets = lock(&client.datasets);
    if !datasets.contains_key(path) {
        return Err(rpc_error("pool.dataset.delete", "ENOENT", format!("{path} does not exist")));
    }
    let prefix = format!("{path}/");
    let has_children = datasets.keys().any(|k| k.starts_with(&prefix));
    if has_children && !recursive {
        return Err(rpc_error(
            "pool.dataset.delete",
            "EBUSY",
            format!("{path} has children"),
        ));
    }
    datasets.retain(|k, _| k != path && !k.starts_with(&prefix));
    Ok(())
}
