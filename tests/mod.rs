// Test modules for the device simulator
// This file organizes all unit and integration tests

pub mod common;

pub mod unit {
    pub mod test_config;
    pub mod test_connection_strings;
    pub mod test_provisioner;
    pub mod test_publisher;
    pub mod test_receiver;
    pub mod test_registry_errors;
    pub mod test_retry_policy;
    pub mod test_stream_receiver;
}

pub mod integration {
    pub mod test_memory_hub;
    pub mod test_simulator_e2e;
}

// Test configuration and constants
pub mod test_config {
    pub const TEST_DEVICE_ID: &str = "test-device-001";
    pub const TEST_HUB_CONNECTION: &str =
        "HostName=test-hub.example.net;SharedAccessKeyName=iothubowner;SharedAccessKey=c2VjcmV0";
    pub const TEST_DEVICE_CONNECTION: &str =
        "HostName=test-hub.example.net;DeviceId=test-device-001;SharedAccessKey=ZGV2aWNl";
}
