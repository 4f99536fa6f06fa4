use std::path::Path;

use machine::MachineError;

use crate::config::QemuConfig;

const KVM_DEVICE: &str = "/dev/kvm";

/// Verify that all required host prerequisites are present before create.
///
/// Checks the hypervisor, image and key tools, the boot media, the userdata
/// file, and `/dev/kvm` when acceleration is explicitly requested. Collects all
/// failures and returns them in a single `NotAvailable` error.
pub fn check_prerequisites(config: &QemuConfig) -> Result<(), MachineError> {
    let mut errors = Vec::new();

    check_command(&config.program, "hypervisor", &mut errors);
    check_command(&config.qemu_img, "image tool", &mut errors);
    check_command(&config.ssh_keygen, "key generator", &mut errors);
    check_file_exists(&config.boot_media, "boot media", &mut errors);
    if let Some(userdata) = &config.userdata {
        check_file_exists(userdata, "userdata", &mut errors);
    }
    if config.accel == Some(true) {
        check_kvm(&mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(MachineError::NotAvailable(errors.join("; ")))
    }
}

/// Whether the host advertises hardware acceleration.
pub fn kvm_available() -> bool {
    let mut errors = Vec::new();
    check_kvm(&mut errors);
    errors.is_empty()
}

fn check_command(program: &Path, label: &str, errors: &mut Vec<String>) {
    if which::which(program).is_err() {
        errors.push(format!("{label} not found: {}", program.display()));
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new(KVM_DEVICE);
    if !kvm.exists() {
        errors.push(format!("{KVM_DEVICE} not found (KVM not available)"));
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("{KVM_DEVICE} not accessible: {e}"));
    }
}
