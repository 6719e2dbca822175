//! VI/JSON encoding of the typed models
//!
//! Every data object carries a `_typeName` discriminator; managed objects are
//! referenced as `{"_typeName": "ManagedObjectReference", "type", "value"}`.

use crate::error::VSphereError;
use crate::models::*;
use serde::Deserialize;
use serde_json::{Value, json};

pub(crate) fn moref(kind: &str, value: &str) -> Value {
    json!({"_typeName": "ManagedObjectReference", "type": kind, "value": value})
}

/// Managed object id of a reference returned by the API
pub(crate) fn moref_value(value: &Value) -> Option<String> {
    value.get("value").and_then(Value::as_str).map(str::to_string)
}

fn connectable() -> Value {
    json!({
        "_typeName": "VirtualDeviceConnectInfo",
        "startConnected": true,
        "allowGuestControl": true,
        "connected": true
    })
}

pub(crate) fn device_to_wire(device: &VirtualDevice) -> Value {
    match device {
        VirtualDevice::Controller {
            key,
            controller,
            bus_number,
        } => {
            let mut wire = json!({
                "_typeName": controller.type_name(),
                "key": key,
                "busNumber": bus_number,
            });
            if *controller == ControllerKind::Pvscsi {
                wire["sharedBus"] = json!("noSharing");
            }
            wire
        }
        VirtualDevice::Disk {
            key,
            controller_key,
            unit_number,
            capacity_kb,
            thin,
            file_name,
        } => json!({
            "_typeName": "VirtualDisk",
            "key": key,
            "controllerKey": controller_key,
            "unitNumber": unit_number,
            "capacityInKB": capacity_kb,
            "backing": {
                "_typeName": "VirtualDiskFlatVer2BackingInfo",
                "fileName": file_name.clone().unwrap_or_default(),
                "diskMode": "persistent",
                "thinProvisioned": thin,
                "eagerlyScrub": !thin,
            },
        }),
        VirtualDevice::Cdrom {
            key,
            controller_key,
            unit_number,
            iso_path,
        } => json!({
            "_typeName": "VirtualCdrom",
            "key": key,
            "controllerKey": controller_key,
            "unitNumber": unit_number,
            "backing": {
                "_typeName": "VirtualCdromIsoBackingInfo",
                "fileName": iso_path,
            },
            "connectable": connectable(),
        }),
        VirtualDevice::Nic {
            key,
            model,
            network,
            mac_address,
            physical_function,
        } => {
            let mut wire = json!({
                "_typeName": model.type_name(),
                "key": key,
                "backing": {
                    "_typeName": "VirtualEthernetCardNetworkBackingInfo",
                    "deviceName": network,
                },
                "connectable": connectable(),
            });
            match mac_address {
                Some(mac) => {
                    wire["addressType"] = json!("manual");
                    wire["macAddress"] = json!(mac);
                }
                None => wire["addressType"] = json!("generated"),
            }
            if let Some(pf) = physical_function {
                wire["allowGuestOSMtuChange"] = json!(false);
                wire["sriovBacking"] = json!({
                    "_typeName": "VirtualSriovEthernetCardSriovBackingInfo",
                    "physicalFunctionBacking": {
                        "_typeName": "VirtualPCIPassthroughDeviceBackingInfo",
                        "id": pf,
                        "deviceId": "",
                        "systemId": "",
                        "vendorId": 0,
                        "deviceName": "",
                    },
                });
            }
            wire
        }
        VirtualDevice::Other { key, type_name } => json!({"_typeName": type_name, "key": key}),
    }
}

pub(crate) fn device_change_to_wire(change: &DeviceChange) -> Value {
    let operation = match change.operation {
        DeviceOperation::Add => "add",
        DeviceOperation::Remove => "remove",
        DeviceOperation::Edit => "edit",
    };
    let mut wire = json!({
        "_typeName": "VirtualDeviceConfigSpec",
        "operation": operation,
        "device": device_to_wire(&change.device),
    });
    if change.create_file {
        wire["fileOperation"] = json!("create");
    }
    wire
}

/// `VirtualMachineConfigSpec` for `CreateVM_Task`
pub(crate) fn config_spec(spec: &VmSpec, datastore: &str) -> Value {
    let mut wire = json!({
        "_typeName": "VirtualMachineConfigSpec",
        "name": spec.name,
        "guestId": spec.guest_id,
        "numCPUs": spec.num_cpus,
        "memoryMB": spec.memory_mb,
        "firmware": spec.firmware,
        "files": {
            "_typeName": "VirtualMachineFileInfo",
            "vmPathName": format!("[{datastore}]"),
        },
        "deviceChange": spec.devices.iter().map(device_change_to_wire).collect::<Vec<_>>(),
    });
    if spec.memory_reservation_locked {
        wire["memoryReservationLockedToMax"] = json!(true);
    }
    if !spec.extra_config.is_empty() {
        wire["extraConfig"] = spec
            .extra_config
            .iter()
            .map(|(key, value)| json!({"_typeName": "OptionValue", "key": key, "value": value}))
            .collect();
    }
    wire
}

/// `VirtualMachineConfigSpec` carrying only device changes
pub(crate) fn reconfig_spec(changes: &[DeviceChange]) -> Value {
    json!({
        "spec": {
            "_typeName": "VirtualMachineConfigSpec",
            "deviceChange": changes.iter().map(device_change_to_wire).collect::<Vec<_>>(),
        }
    })
}

fn int(value: &Value, field: &str) -> Option<i32> {
    value.get(field).and_then(Value::as_i64).and_then(|n| i32::try_from(n).ok())
}

fn string(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn device_from_wire(value: &Value) -> VirtualDevice {
    let type_name = value.get("_typeName").and_then(Value::as_str).unwrap_or_default();
    let key = int(value, "key").unwrap_or_default();

    if let Some(controller) = ControllerKind::from_type_name(type_name) {
        return VirtualDevice::Controller {
            key,
            controller,
            bus_number: int(value, "busNumber").unwrap_or_default(),
        };
    }
    match type_name {
        "VirtualDisk" => VirtualDevice::Disk {
            key,
            controller_key: int(value, "controllerKey").unwrap_or_default(),
            unit_number: int(value, "unitNumber"),
            capacity_kb: value.get("capacityInKB").and_then(Value::as_u64).unwrap_or_default(),
            thin: value
                .pointer("/backing/thinProvisioned")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            file_name: string(value, "/backing/fileName").filter(|f| !f.is_empty()),
        },
        "VirtualCdrom" => VirtualDevice::Cdrom {
            key,
            controller_key: int(value, "controllerKey").unwrap_or_default(),
            unit_number: int(value, "unitNumber"),
            iso_path: string(value, "/backing/fileName").unwrap_or_default(),
        },
        "VirtualVmxnet3" | "VirtualSriovEthernetCard" => VirtualDevice::Nic {
            key,
            model: if type_name == "VirtualSriovEthernetCard" {
                NicKind::Sriov
            } else {
                NicKind::Vmxnet3
            },
            network: string(value, "/backing/deviceName").unwrap_or_default(),
            mac_address: string(value, "/macAddress"),
            physical_function: string(value, "/sriovBacking/physicalFunctionBacking/id"),
        },
        other => VirtualDevice::Other {
            key,
            type_name: other.to_string(),
        },
    }
}

/// Build [`VmInfo`] from the `config` and `runtime` properties of a VM
pub(crate) fn vm_info_from_wire(id: &str, config: &Value, runtime: &Value) -> Result<VmInfo, VSphereError> {
    let power_state = runtime
        .get("powerState")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or(PowerState::PoweredOff);
    let hardware = config.get("hardware").cloned().unwrap_or(Value::Null);

    Ok(VmInfo {
        id: id.to_string(),
        name: string(config, "/name").unwrap_or_default(),
        power_state,
        num_cpus: hardware
            .get("numCPU")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or_default(),
        memory_mb: hardware.get("memoryMB").and_then(Value::as_u64).unwrap_or_default(),
        vmx_path: string(config, "/files/vmPathName"),
        devices: hardware
            .get("device")
            .and_then(Value::as_array)
            .map(|devices| devices.iter().map(device_from_wire).collect())
            .unwrap_or_default(),
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTaskInfo {
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Fault type name and message of a `LocalizedMethodFault` or raw fault body
pub(crate) fn fault_details(fault: &Value) -> (Option<String>, String) {
    let inner = fault.get("fault").unwrap_or(fault);
    let fault_type = inner
        .get("_typeName")
        .and_then(Value::as_str)
        .filter(|t| *t != "LocalizedMethodFault")
        .map(str::to_string);
    let message = string(fault, "/localizedMessage")
        .filter(|m| !m.is_empty())
        .or_else(|| string(inner, "/message"))
        .or_else(|| {
            inner
                .pointer("/faultMessage/0/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| fault_type.clone())
        .unwrap_or_else(|| "unknown fault".to_string());
    (fault_type, message)
}

/// Parse an error response body, tolerating non-JSON bodies
pub(crate) fn fault_from_body(body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) => fault_details(&value),
        _ => (None, body.chars().take(500).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_wire_format() {
        let disk = VirtualDevice::Disk {
            key: -400,
            controller_key: 31000,
            unit_number: Some(0),
            capacity_kb: 100 * 1024 * 1024,
            thin: true,
            file_name: None,
        };
        let wire = device_change_to_wire(&DeviceChange::add(disk));
        assert_eq!(wire["operation"], "add");
        assert_eq!(wire["fileOperation"], "create");
        assert_eq!(wire["device"]["_typeName"], "VirtualDisk");
        assert_eq!(wire["device"]["controllerKey"], 31000);
        assert_eq!(wire["device"]["capacityInKB"], 104_857_600u64);
        assert_eq!(wire["device"]["backing"]["thinProvisioned"], true);
    }

    #[test]
    fn test_sriov_nic_wire_format() {
        let nic = VirtualDevice::Nic {
            key: -300,
            model: NicKind::Sriov,
            network: "SRIOV-PG".to_string(),
            mac_address: Some("00:50:56:aa:bb:cc".to_string()),
            physical_function: Some("0000:3b:00.0".to_string()),
        };
        let wire = device_to_wire(&nic);
        assert_eq!(wire["_typeName"], "VirtualSriovEthernetCard");
        assert_eq!(wire["addressType"], "manual");
        assert_eq!(wire["sriovBacking"]["physicalFunctionBacking"]["id"], "0000:3b:00.0");
    }

    #[test]
    fn test_devices_parse_back() {
        let config = json!({
            "name": "k8s0",
            "files": {"vmPathName": "[datastore1] k8s0/k8s0.vmx"},
            "hardware": {
                "numCPU": 4,
                "memoryMB": 8192,
                "device": [
                    {"_typeName": "VirtualNVMEController", "key": 31000, "busNumber": 0},
                    {"_typeName": "VirtualDisk", "key": 2000, "controllerKey": 31000, "unitNumber": 0,
                     "capacityInKB": 1024, "backing": {"fileName": "[datastore1] k8s0/k8s0.vmdk", "thinProvisioned": true}},
                    {"_typeName": "VirtualVmxnet3", "key": 4000, "backing": {"deviceName": "VM Network"}, "macAddress": "00:0c:29:01:02:03"},
                    {"_typeName": "VirtualKeyboard", "key": 600}
                ]
            }
        });
        let info = vm_info_from_wire("12", &config, &json!({"powerState": "poweredOn"})).unwrap();
        assert_eq!(info.name, "k8s0");
        assert_eq!(info.power_state, PowerState::PoweredOn);
        assert_eq!(info.vmx_path.as_deref(), Some("[datastore1] k8s0/k8s0.vmx"));
        assert_eq!(info.controllers().count(), 1);
        assert_eq!(info.disks().next().and_then(VirtualDevice::controller_key), Some(31000));
        assert!(matches!(info.devices[3], VirtualDevice::Other { ref type_name, .. } if type_name == "VirtualKeyboard"));
    }

    #[test]
    fn test_task_fault_details() {
        let error = json!({
            "_typeName": "LocalizedMethodFault",
            "fault": {"_typeName": "InvalidPowerState"},
            "localizedMessage": "The attempted operation cannot be performed in the current state (Powered on)."
        });
        let (fault, message) = fault_details(&error);
        assert_eq!(fault.as_deref(), Some("InvalidPowerState"));
        assert!(message.starts_with("The attempted operation"));

        let (fault, message) = fault_from_body("<html>502 Bad Gateway</html>");
        assert!(fault.is_none());
        assert!(message.contains("502"));
    }
}
