//! Power operations for MockVSphereClient

use super::{MockVSphereClient, lock, not_found, task_error};
use crate::error::VSphereError;
use crate::models::PowerState;

fn invalid_power_state(method: &str, state: PowerState) -> VSphereError {
    task_error(
        method,
        Some("InvalidPowerState"),
        format!("The attempted operation cannot be performed in the current state ({state})."),
    )
}

pub fn power_on(client: &MockVSphereClient, vm_id: &str) -> Result<(), VSphereError> {
    client.record("PowerOnVM_Task", vm_id)?;
    let mut vms = lock(&client.vms);
    let vm = vms.get_mut(vm_id).ok_or_else(|| not_found(vm_id))?;

    if vm.info.power_state == PowerState::PoweredOn {
        return Err(invalid_power_state("PowerOnVM_Task", vm.info.power_state));
    }
    if vm.descriptor_stale {
        return Err(task_error(
            "PowerOnVM_Task",
            None,
            "disk adapter type mismatch: descriptor does not match the configured disks".to_string(),
        ));
    }
    vm.info.power_state = PowerState::PoweredOn;
    Ok(())
}

pub fn power_off(client: &MockVSphereClient, vm_id: &str) -> Result<(), VSphereError> {
    client.record("PowerOffVM_Task", vm_id)?;
    let mut vms = lock(&client.vms);
    let vm = vms.get_mut(vm_id).ok_or_else(|| not_found(vm_id))?;

    if vm.info.power_state == PowerState::PoweredOff {
        return Err(invalid_power_state("PowerOffVM_Task", vm.info.power_state));
    }
    vm.info.power_state = PowerState::PoweredOff;
    Ok(())
}

pub fn destroy_vm(client: &MockVSphereClient, vm_id: &str) -> Result<(), VSphereError> {
    client.record("Destroy_Task", vm_id)?;
    let mut vms = lock(&client.vms);
    let state = vms.get(vm_id).ok_or_else(|| not_found(vm_id))?.info.power_state;
    if state == PowerState::PoweredOn {
        return Err(invalid_power_state("Destroy_Task", state));
    }
    vms.remove(vm_id);
    Ok(())
}
