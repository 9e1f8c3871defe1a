#[cfg(test)]
mod tests {
    use std::fs;

    use pyjvm_compiler::CompilerOptions;
    use pyjvm_pylib::Vm;
    use tempfile::TempDir;

    use crate::archive::{self, ArchiveError, Entry, EntryKind};
    use crate::{compile, load_input, run_module};

    fn entries() -> Vec<Entry> {
        vec![
            Entry { kind: EntryKind::Unit, name: "main.class".into(), data: vec![0xCA, 0xFE, 0xBA, 0xBE] },
            Entry { kind: EntryKind::Resource, name: "data/a.txt".into(), data: b"hello".to_vec() },
        ]
    }

    #[test]
    fn test_archive_round_trip() {
        let bytes = archive::encode(&entries()).unwrap();
        assert_eq!(&bytes[..4], archive::MAGIC);
        assert_eq!(archive::decode(&bytes).unwrap(), entries());
    }

    #[test]
    fn test_archive_detects_corruption() {
        let mut bytes = archive::encode(&entries()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(archive::decode(&bytes), Err(ArchiveError::Digest(name)) if name == "data/a.txt"));
    }

    #[test]
    fn test_archive_rejects_foreign_data() {
        assert!(matches!(archive::decode(b"PK\x03\x04"), Err(ArchiveError::BadMagic)));
        assert!(matches!(archive::decode(b"PY"), Err(ArchiveError::BadMagic)));
        let bytes = archive::encode(&entries()).unwrap();
        assert!(matches!(archive::decode(&bytes[..bytes.len() - 2]), Err(ArchiveError::Truncated)));
    }

    #[test]
    fn test_digest_is_sha256() {
        let hex: String = archive::digest(b"abc").iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn test_compile_to_directory_and_archive() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("hello.py"), "def greet(n):\n    return 'hi ' + n\nprint(greet('there'))\n").unwrap();
        let res = TempDir::new().unwrap();
        fs::write(res.path().join("notes.txt"), "resource").unwrap();
        let out = TempDir::new().unwrap();
        let bundle = out.path().join("bundle.pyar");
        let classes = out.path().join("classes");

        let code = compile(
            &[src.path().to_path_buf()],
            Some(res.path()),
            Some(&classes),
            Some(&bundle),
            false,
            &CompilerOptions::default(),
        )
        .unwrap();
        assert_eq!(code, 0);
        assert!(classes.join("hello.class").is_file());

        let entries = archive::read(&bundle).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["hello.class", "notes.txt"]);

        for input in [&classes, &bundle] {
            let mut vm = Vm::new();
            vm.capture_output();
            assert_eq!(load_input(&mut vm, input).unwrap(), 1);
            vm.run_main("hello").unwrap();
            assert_eq!(vm.take_output(), "hi there\n");
        }
    }

    #[test]
    fn test_compile_reports_failure() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("broken.py"), "x = = 1\n").unwrap();
        fs::write(src.path().join("fine.py"), "y = 1\n").unwrap();
        let out = TempDir::new().unwrap();
        let code =
            compile(&[src.path().to_path_buf()], None, Some(out.path()), None, true, &CompilerOptions::default())
                .unwrap();
        assert_eq!(code, 1);
        assert!(out.path().join("fine.class").is_file());
        assert!(!out.path().join("broken.class").exists());
    }

    #[test]
    fn test_run_maps_system_exit_to_status() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("quits.py"), "import sys\nsys.exit(len(sys.argv))\n").unwrap();
        fs::write(src.path().join("fails.py"), "raise ValueError('no')\n").unwrap();
        fs::write(src.path().join("ok.py"), "import sys\nsys.exit()\n").unwrap();
        let out = TempDir::new().unwrap();
        let code =
            compile(&[src.path().to_path_buf()], None, Some(out.path()), None, false, &CompilerOptions::default())
                .unwrap();
        assert_eq!(code, 0);

        let status = |module: &str, argv: &[&str]| {
            let mut vm = Vm::new();
            vm.set_argv(argv.iter().map(|a| a.to_string()).collect());
            load_input(&mut vm, out.path()).unwrap();
            run_module(&mut vm, module).unwrap()
        };
        assert_eq!(status("quits", &["quits", "a", "b"]), 3);
        assert_eq!(status("fails", &["fails"]), 1);
        assert_eq!(status("ok", &["ok"]), 0);
    }
}
