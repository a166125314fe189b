//! Names shared between the operator side and the capture workload.

/// Label every capture workload carries.
pub const APP_LABEL_KEY: &str = "app";
pub const APP_LABEL_VALUE: &str = "capture";
/// Label tying a workload or secret to the capture that created it.
pub const CAPTURE_NAME_LABEL_KEY: &str = "nettrace.io/capture-name";

pub const CAPTURE_FILENAME_ANNOTATION: &str = "nettrace.io/capture-filename";
pub const CAPTURE_TIMESTAMP_ANNOTATION: &str = "nettrace.io/capture-timestamp";

pub const CAPTURE_FINALIZER: &str = "nettrace.io/capture-cleanup";
pub const MANAGED_SECRET_PREFIX: &str = "managed-";

pub const NODE_OS_LABEL: &str = "kubernetes.io/os";
pub const NODE_HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const DEFAULT_NAMESPACE: &str = "default";

// Workload environment
pub const ENV_CAPTURE_NAME: &str = "CAPTURE_NAME";
pub const ENV_NODE_HOST_NAME: &str = "NODE_HOST_NAME";
pub const ENV_CAPTURE_START_TIMESTAMP: &str = "CAPTURE_START_TIMESTAMP";
pub const ENV_TCPDUMP_FILTER: &str = "TCPDUMP_FILTER";
pub const ENV_TCPDUMP_RAW_FILTER: &str = "TCPDUMP_RAW_FILTER";
pub const ENV_NETSH_FILTER: &str = "NETSH_FILTER";
pub const ENV_PACKET_SIZE: &str = "PACKET_SIZE";
pub const ENV_CAPTURE_MAX_SIZE: &str = "CAPTURE_MAX_SIZE";
pub const ENV_CAPTURE_DURATION: &str = "CAPTURE_DURATION";
pub const ENV_CAPTURE_INTERFACES: &str = "CAPTURE_INTERFACES";
pub const ENV_INCLUDE_METADATA: &str = "INCLUDE_METADATA";
pub const ENV_APISERVER: &str = "APISERVER";
pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_CONTAINER_SANDBOX_MOUNT_POINT: &str = "CONTAINER_SANDBOX_MOUNT_POINT";

// Output locations
pub const ENV_OUTPUT_HOST_PATH: &str = "HOSTPATH";
pub const ENV_OUTPUT_PVC: &str = "PVC";
pub const ENV_S3_ENDPOINT: &str = "S3_ENDPOINT";
pub const ENV_S3_REGION: &str = "S3_REGION";
pub const ENV_S3_BUCKET: &str = "S3_BUCKET";
pub const ENV_S3_PATH: &str = "S3_PATH";

pub const BLOB_SECRET_KEY: &str = "blob-upload-url";
pub const BLOB_SECRET_MOUNT_PATH: &str = "/etc/blob-upload-secret";
pub const S3_SECRET_MOUNT_PATH: &str = "/etc/s3-upload-secret";
pub const S3_ACCESS_KEY_ID_KEY: &str = "s3-access-key-id";
pub const S3_SECRET_ACCESS_KEY_KEY: &str = "s3-secret-access-key";

pub const PVC_VOLUME_NAME: &str = "capture-pvc";
pub const PVC_MOUNT_PATH_LINUX: &str = "/mnt/capture";
pub const PVC_MOUNT_PATH_WINDOWS: &str = "C:\\mnt\\capture";
pub const HOST_PATH_VOLUME_NAME: &str = "capture-hostpath";

pub const CONTAINER_NAME: &str = "capture";
pub const LINUX_ENTRYPOINT: &str = "/nettrace/nettrace-capture";
pub const WINDOWS_ENTRYPOINT: &str = "nettrace-capture.exe";

/// Folder under the temp dir holding capture working directories. The
/// Windows runtime also looks for it in `netsh trace` status to recognise
/// its own sessions.
pub const CAPTURE_WORK_FOLDER: &str = "nettrace-capture";
