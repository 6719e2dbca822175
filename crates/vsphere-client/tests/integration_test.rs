//! Integration tests for vSphere client
//!
//! These tests require a reachable vCenter or ESXi host.
//! Set VSPHERE_HOST, VSPHERE_USERNAME and VSPHERE_PASSWORD environment
//! variables to run, and VSPHERE_DATASTORE to a writable datastore.

use vsphere_client::{PowerState, VSphereClient, VSphereClientTrait, VSphereConfig, VmSpec};

fn client() -> VSphereClient {
    let host = std::env::var("VSPHERE_HOST").unwrap_or_else(|_| "esxi.local".to_string());
    let username = std::env::var("VSPHERE_USERNAME").unwrap_or_else(|_| "root".to_string());
    let password = std::env::var("VSPHERE_PASSWORD").expect("VSPHERE_PASSWORD environment variable must be set");
    let datastore = std::env::var("VSPHERE_DATASTORE").unwrap_or_else(|_| "datastore1".to_string());

    let mut config = VSphereConfig::esxi(host, username, password, datastore);
    config.verify_tls = false;
    VSphereClient::new(config).expect("Failed to build client")
}

#[tokio::test]
#[ignore] // Requires running vSphere instance
async fn test_list_vms() {
    let vms = client().list_vms().await.expect("Failed to list VMs");
    println!("Found {} VMs", vms.len());
}

#[tokio::test]
#[ignore]
async fn test_create_reregister_and_destroy_vm() {
    let client = client();
    let vm_id = client
        .create_vm(&VmSpec::new("integration-test-vm", 1, 1024))
        .await
        .expect("Failed to create VM");

    let info = client.get_vm_info(&vm_id).await.expect("Failed to read VM");
    assert_eq!(info.power_state, PowerState::PoweredOff);
    let vmx_path = info.vmx_path.expect("VM has no descriptor path");

    client.unregister_vm(&vm_id).await.expect("Failed to unregister VM");
    let vm_id = client
        .register_vm(&vmx_path, "integration-test-vm")
        .await
        .expect("Failed to register VM");

    client.destroy_vm(&vm_id).await.expect("Failed to destroy VM");
    assert!(client.find_vm("integration-test-vm").await.expect("Failed to list VMs").is_none());
}
