// Copyright © 2025 The Block Hotplug Test Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
#[cfg(feature = "integration_tests")]
mod tests {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    use test_infra::{
        capability_verdict, run_attach_detach_loop, ApiBlockDeviceOperator, BlockDeviceBinding,
        DomainConfig, DomainController, Verdict, VirtMode, DEFAULT_ITERATIONS,
    };

    fn hypervisor_path() -> PathBuf {
        env::var("HYPERVISOR_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("cloud-hypervisor"))
    }

    #[test]
    fn test_block_attach_detach_repeatedly() {
        let config = DomainConfig::with_defaults(hypervisor_path(), VirtMode::Paravirtualized);
        assert!(capability_verdict(config.mode).is_none());

        let domain = DomainController::start(&config).unwrap();

        let mut console = domain.console();
        console.set_history_save(true);
        console.run_cmd("ls").unwrap();

        // A small raw image stands in for the host block resource.
        let backing = domain.api_socket_path().with_file_name("hotplug.img");
        let backing_file = fs::File::create(&backing).unwrap();
        backing_file.set_len(64 << 20).unwrap();

        let binding = BlockDeviceBinding {
            backend: format!("file:{}", backing.display()).parse().unwrap(),
            frontend: String::from("vdc"),
        };
        let mut operator = ApiBlockDeviceOperator::new(domain.api_socket_path());

        let verdict =
            run_attach_detach_loop(&mut operator, &mut console, &binding, DEFAULT_ITERATIONS)
                .unwrap();
        assert_eq!(verdict, Verdict::Pass);

        domain.stop().unwrap();
    }

    #[test]
    fn test_hvm_guest_is_skipped() {
        // No domain is created for an unsupported mode; the capability check
        // alone decides the verdict.
        match capability_verdict(VirtMode::HardwareAssisted) {
            Some(Verdict::Skip { .. }) => (),
            v => panic!("expected a skip verdict, got {v:?}"),
        }
    }
}
