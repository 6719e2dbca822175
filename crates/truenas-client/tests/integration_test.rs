//! Integration tests for TrueNAS client
//!
//! These tests require a reachable TrueNAS SCALE instance.
//! Set TRUENAS_HOST and TRUENAS_API_KEY environment variables to run, and
//! TRUENAS_POOL to a pool the key may write to.

use truenas_client::{CreateDatasetRequest, DatasetType, TrueNasClient, TrueNasClientTrait};

fn client() -> TrueNasClient {
    let host = std::env::var("TRUENAS_HOST").unwrap_or_else(|_| "truenas.local".to_string());
    let api_key = std::env::var("TRUENAS_API_KEY").expect("TRUENAS_API_KEY environment variable must be set");
    TrueNasClient::new(host, api_key, false)
}

#[tokio::test]
#[ignore] // Requires running TrueNAS instance
async fn test_list_vms() {
    let vms = client().list_vms().await.expect("Failed to list VMs");
    println!("Found {} VMs", vms.len());
}

#[tokio::test]
#[ignore]
async fn test_query_volumes() {
    let volumes = client()
        .query_datasets(Some(DatasetType::Volume))
        .await
        .expect("Failed to query volumes");
    assert!(volumes.iter().all(|v| v.is_volume()));
    println!("Found {} volumes", volumes.len());
}

#[tokio::test]
#[ignore]
async fn test_create_and_delete_volume() {
    let pool = std::env::var("TRUENAS_POOL").unwrap_or_else(|_| "tank".to_string());
    let client = client();
    let path = format!("{pool}/integration_test-boot");

    client
        .create_dataset(&CreateDatasetRequest::volume(path.as_str(), 1024 * 1024 * 1024, true))
        .await
        .expect("Failed to create volume");
    assert!(client.get_dataset(&path).await.expect("Failed to query volume").is_some());

    client
        .delete_dataset(&path, true, true)
        .await
        .expect("Failed to delete volume");
    assert!(client.get_dataset(&path).await.expect("Failed to query volume").is_none());
}
