//! End-to-end tests: build small relocatable objects in memory, link them
//! through the public `Linker` entry point, then parse the output and check
//! the things a user would check with readelf.

use object::Object as _;
use object::ObjectSection as _;
use object::ObjectSymbol as _;
use object::write::Object;
use object::write::Relocation;
use object::write::Symbol;
use object::write::SymbolSection;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

static NEXT_TEST_ID: AtomicU32 = AtomicU32::new(0);

struct TestDir {
    path: PathBuf,
}

impl TestDir {
    fn new() -> TestDir {
        let path = std::env::temp_dir().join(format!(
            "libmold-test-{}-{}",
            std::process::id(),
            NEXT_TEST_ID.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path).unwrap();
        TestDir { path }
    }

    fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn output(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn new_object() -> Object<'static> {
    Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    )
}

fn global_symbol(name: &[u8], size: u64) -> Symbol {
    Symbol {
        name: name.to_vec(),
        value: 0,
        size,
        kind: object::SymbolKind::Text,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Undefined,
        flags: object::SymbolFlags::None,
    }
}

/// An object whose named function (8 bytes: mov eax, imm; ret; padding)
/// optionally calls another symbol with a PLT32 relocation.
fn function_object(name: &[u8], section_suffix: &[u8], calls: Option<&[u8]>) -> Vec<u8> {
    let mut obj = new_object();
    let section_name = [b".text.", section_suffix].concat();
    let section = obj.add_section(Vec::new(), section_name, object::SectionKind::Text);
    // mov $42, %eax ; call rel32 0 ; ret
    let code: &[u8] = &[
        0xb8, 0x2a, 0x00, 0x00, 0x00, // mov $42, %eax
        0xe8, 0x00, 0x00, 0x00, 0x00, // call <target>
        0xc3, // ret
        0x90, 0x90, 0x90, 0x90, 0x90, // padding
    ];
    obj.append_section_data(section, code, 16);

    let mut symbol = global_symbol(name, code.len() as u64);
    symbol.section = SymbolSection::Section(section);
    obj.add_symbol(symbol);

    if let Some(target) = calls {
        let target_id = obj.add_symbol(global_symbol(target, 0));
        obj.add_relocation(
            section,
            Relocation {
                offset: 6,
                symbol: target_id,
                addend: -4,
                flags: object::RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_PLT32,
                },
            },
        )
        .unwrap();
    }
    obj.write().unwrap()
}

/// Builds a System V archive from (member name, bytes) pairs.
fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut data = b"!<arch>\n".to_vec();
    for (name, contents) in members {
        let ident = format!("{name}/");
        let mut header = Vec::new();
        header.extend_from_slice(format!("{ident:<16}").as_bytes());
        header.extend_from_slice(b"0           ");
        header.extend_from_slice(b"0     ");
        header.extend_from_slice(b"0     ");
        header.extend_from_slice(b"644     ");
        header.extend_from_slice(format!("{:<10}", contents.len()).as_bytes());
        header.extend_from_slice(b"`\n");
        assert_eq!(header.len(), 60);
        data.extend_from_slice(&header);
        data.extend_from_slice(contents);
        if contents.len() % 2 == 1 {
            data.push(b'\n');
        }
    }
    data
}

fn link(args: &[&str]) -> libmold::error::Result {
    libmold::Linker::from_args(args.iter())?.run()
}

fn read_output(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

fn symbol_names(data: &[u8]) -> Vec<String> {
    let file = object::File::parse(data).unwrap();
    file.symbols()
        .filter_map(|s| s.name().ok().map(str::to_owned))
        .collect()
}

#[test]
fn test_link_simple_executable() {
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"foo")));
    let foo = dir.file("foo.o", &function_object(b"foo", b"foo", None));
    let out = dir.output("simple");

    link(&[
        "-o",
        out.to_str().unwrap(),
        main.to_str().unwrap(),
        foo.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    assert_eq!(file.format(), object::BinaryFormat::Elf);
    assert!(file.entry() != 0);

    let names = symbol_names(&data);
    assert!(names.iter().any(|n| n == "_start"));
    assert!(names.iter().any(|n| n == "foo"));

    // The call displacement must land exactly on foo.
    let start = file.symbols().find(|s| s.name() == Ok("_start")).unwrap();
    let foo_sym = file.symbols().find(|s| s.name() == Ok("foo")).unwrap();
    let text = file
        .sections()
        .find(|s| s.name() == Ok(".text"))
        .unwrap();
    let text_data = text.data().unwrap();
    let call_offset = (start.address() - text.address()) as usize + 6;
    let displacement =
        i32::from_le_bytes(text_data[call_offset..call_offset + 4].try_into().unwrap());
    let place = start.address() + 6;
    assert_eq!(
        (place as i64 + 4 + i64::from(displacement)) as u64,
        foo_sym.address(),
    );
}

#[test]
fn test_mutually_recursive_archives() {
    // a.a defines f (calling g); b.a defines g (calling f); main references
    // f. Both members must be pulled in and each symbol defined once.
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"f")));
    let archive_a = dir.file(
        "liba.a",
        &build_archive(&[("f.o", &function_object(b"f", b"f", Some(b"g")))]),
    );
    let archive_b = dir.file(
        "libb.a",
        &build_archive(&[("g.o", &function_object(b"g", b"g", Some(b"f")))]),
    );
    let out = dir.output("recursive");

    link(&[
        "-o",
        out.to_str().unwrap(),
        main.to_str().unwrap(),
        archive_a.to_str().unwrap(),
        archive_b.to_str().unwrap(),
    ])
    .unwrap();

    let names = symbol_names(&read_output(&out));
    assert_eq!(names.iter().filter(|n| *n == "f").count(), 1);
    assert_eq!(names.iter().filter(|n| *n == "g").count(), 1);
}

#[test]
fn test_unreferenced_archive_member_not_loaded() {
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", None));
    let archive = dir.file(
        "libunused.a",
        &build_archive(&[("u.o", &function_object(b"unused_fn", b"u", None))]),
    );
    let out = dir.output("nounused");

    link(&[
        "-o",
        out.to_str().unwrap(),
        main.to_str().unwrap(),
        archive.to_str().unwrap(),
    ])
    .unwrap();

    let names = symbol_names(&read_output(&out));
    assert!(!names.iter().any(|n| n == "unused_fn"));
}

#[test]
fn test_whole_archive_loads_everything() {
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", None));
    let archive = dir.file(
        "libwhole.a",
        &build_archive(&[("w.o", &function_object(b"whole_fn", b"w", None))]),
    );
    let out = dir.output("whole");

    link(&[
        "-o",
        out.to_str().unwrap(),
        main.to_str().unwrap(),
        "--whole-archive",
        archive.to_str().unwrap(),
        "--no-whole-archive",
    ])
    .unwrap();

    let names = symbol_names(&read_output(&out));
    assert!(names.iter().any(|n| n == "whole_fn"));
}

#[test]
fn test_gc_sections_removes_unreferenced_function() {
    let dir = TestDir::new();
    let mut obj = new_object();
    for name in [b"_start".as_slice(), b"dead_fn".as_slice()] {
        let section_name = [b".text.", name].concat();
        let section = obj.add_section(Vec::new(), section_name, object::SectionKind::Text);
        obj.append_section_data(section, &[0xb8, 1, 0, 0, 0, 0xc3], 16);
        let mut symbol = global_symbol(name, 6);
        symbol.section = SymbolSection::Section(section);
        obj.add_symbol(symbol);
    }
    let input = dir.file("gc.o", &obj.write().unwrap());
    let out = dir.output("gc");

    link(&[
        "-o",
        out.to_str().unwrap(),
        "--gc-sections",
        input.to_str().unwrap(),
    ])
    .unwrap();

    let names = symbol_names(&read_output(&out));
    assert!(names.iter().any(|n| n == "_start"));
    assert!(!names.iter().any(|n| n == "dead_fn"));
}

#[test]
fn test_duplicate_strong_definitions_fail() {
    let dir = TestDir::new();
    let a = dir.file("dup1.o", &function_object(b"x", b"x1", None));
    let b = dir.file("dup2.o", &function_object(b"x", b"x2", None));
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"x")));
    let out = dir.output("dup");

    let error = link(&[
        "-o",
        out.to_str().unwrap(),
        main.to_str().unwrap(),
        a.to_str().unwrap(),
        b.to_str().unwrap(),
    ])
    .unwrap_err();
    let message = format!("{error:#}");
    assert!(message.contains("duplicate symbol"), "{message}");
    assert!(message.contains("dup1.o"), "{message}");
    assert!(message.contains("dup2.o"), "{message}");
}

#[test]
fn test_allow_multiple_definition_flag() {
    let dir = TestDir::new();
    let a = dir.file("dup1.o", &function_object(b"x", b"x1", None));
    let b = dir.file("dup2.o", &function_object(b"x", b"x2", None));
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"x")));
    let out = dir.output("dup-ok");

    link(&[
        "-o",
        out.to_str().unwrap(),
        "--allow-multiple-definition",
        main.to_str().unwrap(),
        a.to_str().unwrap(),
        b.to_str().unwrap(),
    ])
    .unwrap();
}

#[test]
fn test_weak_definition_loses_to_strong() {
    let dir = TestDir::new();
    let mut weak_obj = new_object();
    let section = weak_obj.add_section(Vec::new(), b".text.w".to_vec(), object::SectionKind::Text);
    weak_obj.append_section_data(section, &[0xb8, 7, 0, 0, 0, 0xc3], 16);
    let mut weak_symbol = global_symbol(b"chosen", 6);
    weak_symbol.weak = true;
    weak_symbol.section = SymbolSection::Section(section);
    weak_obj.add_symbol(weak_symbol);

    let weak = dir.file("weak.o", &weak_obj.write().unwrap());
    let strong = dir.file("strong.o", &function_object(b"chosen", b"s", None));
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"chosen")));
    let out = dir.output("weak");

    // The weak definition comes first on the command line but still loses.
    link(&[
        "-o",
        out.to_str().unwrap(),
        main.to_str().unwrap(),
        weak.to_str().unwrap(),
        strong.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    let chosen = file.symbols().find(|s| s.name() == Ok("chosen")).unwrap();
    // The strong definition's code starts with mov $42.
    let text = file.sections().find(|s| s.name() == Ok(".text")).unwrap();
    let offset = (chosen.address() - text.address()) as usize;
    assert_eq!(text.data().unwrap()[offset + 1], 42);
}

#[test]
fn test_common_symbols_merge_to_largest() {
    let dir = TestDir::new();
    let mut paths = Vec::new();
    for (i, (size, alignment)) in [(4u64, 4u64), (8, 8), (4, 4)].iter().enumerate() {
        let mut obj = new_object();
        obj.add_symbol(Symbol {
            name: b"common_x".to_vec(),
            value: *alignment,
            size: *size,
            kind: object::SymbolKind::Data,
            scope: object::SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Common,
            flags: object::SymbolFlags::None,
        });
        paths.push(dir.file(&format!("common{i}.o"), &obj.write().unwrap()));
    }
    let main = dir.file("main.o", &function_object(b"_start", b"main", None));
    let out = dir.output("common");

    let mut args = vec!["-o", out.to_str().unwrap(), main.to_str().unwrap()];
    for path in &paths {
        args.push(path.to_str().unwrap());
    }
    link(&args).unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    let bss = file.sections().find(|s| s.name() == Ok(".bss")).unwrap();
    assert!(bss.size() >= 8, "bss too small: {}", bss.size());
    let common = file
        .symbols()
        .find(|s| s.name() == Ok("common_x"))
        .unwrap();
    // LCM of the alignments is 8.
    assert_eq!(common.address() % 8, 0);
}

#[test]
fn test_shared_object_with_version_script() {
    let dir = TestDir::new();
    let mut obj = new_object();
    for name in [b"foo".as_slice(), b"bar".as_slice(), b"baz".as_slice()] {
        let section_name = [b".text.", name].concat();
        let section = obj.add_section(Vec::new(), section_name, object::SectionKind::Text);
        obj.append_section_data(section, &[0xb8, 1, 0, 0, 0, 0xc3], 16);
        let mut symbol = global_symbol(name, 6);
        symbol.section = SymbolSection::Section(section);
        obj.add_symbol(symbol);
    }
    let input = dir.file("versioned.o", &obj.write().unwrap());
    let script = dir.file("script.map", b"VER_X1 { global: *; local: b*; };\n");
    let out = dir.output("libversioned.so");

    link(&[
        "-o",
        out.to_str().unwrap(),
        "-shared",
        "--version-script",
        script.to_str().unwrap(),
        input.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    let dynamic_names: Vec<String> = file
        .dynamic_symbols()
        .filter_map(|s| s.name().ok().map(str::to_owned))
        .collect();
    assert!(dynamic_names.iter().any(|n| n == "foo"), "{dynamic_names:?}");
    assert!(!dynamic_names.iter().any(|n| n == "bar"), "{dynamic_names:?}");
    assert!(!dynamic_names.iter().any(|n| n == "baz"), "{dynamic_names:?}");
}

#[test]
fn test_relocatable_output() {
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"foo")));
    let foo = dir.file("foo.o", &function_object(b"foo", b"foo", None));
    let out = dir.output("combined.o");

    link(&[
        "-o",
        out.to_str().unwrap(),
        "-r",
        main.to_str().unwrap(),
        foo.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    assert_eq!(file.kind(), object::ObjectKind::Relocatable);
    let names = symbol_names(&data);
    assert!(names.iter().any(|n| n == "_start"));
    assert!(names.iter().any(|n| n == "foo"));
    // The call relocation must have been preserved.
    let text = file.sections().find(|s| s.name() == Ok(".text")).unwrap();
    assert!(text.relocations().next().is_some());
}

#[test]
fn test_icf_folds_identical_functions() {
    let dir = TestDir::new();
    let mut obj = new_object();
    for name in [b"first".as_slice(), b"second".as_slice()] {
        let section_name = [b".text.", name].concat();
        let section = obj.add_section(Vec::new(), section_name, object::SectionKind::Text);
        obj.append_section_data(section, &[0xb8, 9, 0, 0, 0, 0xc3], 16);
        let mut symbol = global_symbol(name, 6);
        symbol.section = SymbolSection::Section(section);
        obj.add_symbol(symbol);
    }
    let input = dir.file("icf.o", &obj.write().unwrap());
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"first")));
    let out = dir.output("icf");

    link(&[
        "-o",
        out.to_str().unwrap(),
        "--icf=all",
        main.to_str().unwrap(),
        input.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    let first = file.symbols().find(|s| s.name() == Ok("first")).unwrap();
    let second = file.symbols().find(|s| s.name() == Ok("second")).unwrap();
    assert_eq!(first.address(), second.address());
}

#[test]
fn test_undefined_symbol_reported() {
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", Some(b"missing_fn")));
    let out = dir.output("undef");

    let error = link(&["-o", out.to_str().unwrap(), main.to_str().unwrap()]).unwrap_err();
    let message = format!("{error:#}");
    assert!(message.contains("undefined symbol"), "{message}");
    assert!(message.contains("missing_fn"), "{message}");
}

#[test]
fn test_hidden_losing_definition_suppresses_export() {
    // foo is defined with default visibility in one object (and wins the
    // resolution) but also defined weak+hidden in another. The strictest
    // visibility among all definitions wins, so foo must not be exported.
    let dir = TestDir::new();

    let strong = dir.file("strong.o", &function_object(b"foo", b"s", None));

    let mut hidden_obj = new_object();
    let section =
        hidden_obj.add_section(Vec::new(), b".text.h".to_vec(), object::SectionKind::Text);
    hidden_obj.append_section_data(section, &[0xb8, 7, 0, 0, 0, 0xc3], 16);
    let mut hidden_symbol = global_symbol(b"foo", 6);
    hidden_symbol.weak = true;
    // SymbolScope::Linkage emits STB_GLOBAL with STV_HIDDEN for ELF.
    hidden_symbol.scope = object::SymbolScope::Linkage;
    hidden_symbol.section = SymbolSection::Section(section);
    hidden_obj.add_symbol(hidden_symbol);
    let hidden = dir.file("hidden.o", &hidden_obj.write().unwrap());

    // A control symbol with default visibility everywhere stays exported.
    let exported = dir.file("exported.o", &function_object(b"exported_fn", b"e", None));

    let out = dir.output("libvis.so");
    link(&[
        "-o",
        out.to_str().unwrap(),
        "-shared",
        strong.to_str().unwrap(),
        hidden.to_str().unwrap(),
        exported.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    let dynamic_names: Vec<String> = file
        .dynamic_symbols()
        .filter_map(|s| s.name().ok().map(str::to_owned))
        .collect();
    assert!(
        !dynamic_names.iter().any(|n| n == "foo"),
        "hidden visibility must suppress export: {dynamic_names:?}"
    );
    assert!(
        dynamic_names.iter().any(|n| n == "exported_fn"),
        "{dynamic_names:?}"
    );
}

#[test]
fn test_compress_debug_sections() {
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", None));

    let mut debug_obj = new_object();
    let debug = debug_obj.add_section(
        Vec::new(),
        b".debug_info".to_vec(),
        object::SectionKind::Debug,
    );
    let debug_data: Vec<u8> = (0..512u32).map(|i| (i % 7) as u8).collect();
    debug_obj.append_section_data(debug, &debug_data, 1);
    let debug_input = dir.file("debug.o", &debug_obj.write().unwrap());

    let out = dir.output("compressed");
    link(&[
        "-o",
        out.to_str().unwrap(),
        "--compress-debug-sections=zlib",
        main.to_str().unwrap(),
        debug_input.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    let section = file
        .sections()
        .find(|s| s.name() == Ok(".debug_info"))
        .unwrap();
    let object::SectionFlags::Elf { sh_flags } = section.flags() else {
        panic!("expected ELF section flags");
    };
    assert_ne!(
        sh_flags & u64::from(object::elf::SHF_COMPRESSED),
        0,
        "section should carry SHF_COMPRESSED"
    );
    // The stored form is smaller than the original plus its header, and
    // decompressing gives back the relocated contents.
    assert!(section.data().unwrap().len() < debug_data.len());
    let uncompressed = section.uncompressed_data().unwrap();
    assert_eq!(uncompressed.as_ref(), debug_data.as_slice());
}

#[test]
fn test_defsym_absolute() {
    let dir = TestDir::new();
    let main = dir.file("main.o", &function_object(b"_start", b"main", None));
    let out = dir.output("defsym");

    link(&[
        "-o",
        out.to_str().unwrap(),
        "--defsym=magic_marker=0xcafe",
        main.to_str().unwrap(),
    ])
    .unwrap();

    let data = read_output(&out);
    let file = object::File::parse(data.as_slice()).unwrap();
    let marker = file
        .symbols()
        .find(|s| s.name() == Ok("magic_marker"))
        .unwrap();
    assert_eq!(marker.address(), 0xcafe);
}
