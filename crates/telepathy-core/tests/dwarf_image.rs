//! Image reader scenarios against a real compiled ELF fixture.
//!
//! `fixtures/controller.elf` is `fixtures/controller.c` built with
//! `gcc -m32 -g -gdwarf-4 -nostdlib -static -no-pie`. The assertions below
//! pin the layout that compiler produced: a 36-byte structure with three
//! bit-fields sharing one 16-bit storage unit, a typedef'd nested structure
//! with one- and two-dimensional arrays, an anonymous union, a volatile
//! double and a plain array in `.bss`.

use object::{Object, ObjectSection};

use telepathy_core::symbols::dwarf::read_image_bytes;
use telepathy_core::types::BitField;
use telepathy_core::variables;
use telepathy_core::{ByteOrder, MemoryImage, Type, Value};

const FIXTURE: &[u8] = include_bytes!("fixtures/controller.elf");

#[test]
fn image_symbols_resolve_with_compiler_layout() {
    let image = read_image_bytes(FIXTURE).unwrap();
    let symbols = &image.symbols;

    let ctrl = symbols.resolve("g_ctrl").unwrap();
    assert_eq!(ctrl.address, 0x0804_C000);
    assert_eq!(ctrl.ty.size(), 36);

    let mode = symbols.resolve("g_ctrl.mode").unwrap();
    assert_eq!(mode.address, 0x0804_C000);
    assert_eq!(mode.ty, Type::unsigned(1));

    // The three bit-fields share the 16-bit storage unit at offset 0; the
    // compiler emits MSB-counted DWARF v3 offsets, normalised here to count
    // from the unit's least significant bit.
    let enabled = symbols.resolve("g_ctrl.enabled").unwrap();
    assert_eq!(enabled.address, 0x0804_C000);
    assert_eq!(enabled.ty, Type::unsigned(2));
    assert_eq!(
        enabled.bits,
        Some(BitField {
            bit_offset: 8,
            bit_width: 1
        })
    );

    let level = symbols.resolve("g_ctrl.level").unwrap();
    assert_eq!(
        level.bits,
        Some(BitField {
            bit_offset: 9,
            bit_width: 3
        })
    );

    let trim = symbols.resolve("g_ctrl.trim").unwrap();
    assert_eq!(trim.ty, Type::signed(2));
    assert_eq!(
        trim.bits,
        Some(BitField {
            bit_offset: 12,
            bit_width: 4
        })
    );

    // Typedef'd nested structure: gains[4] at offset 4, raw[2][3] at 20.
    let gain = symbols.resolve("g_ctrl.inner.gains[2]").unwrap();
    assert_eq!(gain.address, 0x0804_C000 + 4 + 2 * 4);
    assert_eq!(gain.ty, Type::float(4));

    let raw = symbols.resolve("g_ctrl.inner.raw[1][2]").unwrap();
    assert_eq!(raw.address, 0x0804_C000 + 20 + 6 + 4);
    assert_eq!(raw.ty, Type::signed(2));

    // The anonymous union's members are flattened into the parent.
    let word = symbols.resolve("g_ctrl.word").unwrap();
    assert_eq!(word.address, 0x0804_C000 + 32);
    assert_eq!(word.ty, Type::unsigned(4));
    let real = symbols.resolve("g_ctrl.real").unwrap();
    assert_eq!(real.address, 0x0804_C000 + 32);
    assert_eq!(real.ty, Type::float(4));

    // The volatile wrapper strips down to the base type.
    let bus = symbols.resolve("g_bus_voltage").unwrap();
    assert_eq!(bus.address, 0x0804_C028);
    assert_eq!(bus.ty, Type::float(8));

    // Plain array in .bss.
    let counts = symbols.resolve("g_counts").unwrap();
    assert_eq!(counts.address, 0x0804_C040);
    assert_eq!(counts.ty, Type::array(Type::unsigned(4), 8));
    let last = symbols.resolve("g_counts[7]").unwrap();
    assert_eq!(last.address, 0x0804_C040 + 7 * 4);

    // This image carries no version section.
    assert!(image.version_section.is_none());
}

#[test]
fn table_from_an_image_is_deterministic() {
    let first = read_image_bytes(FIXTURE).unwrap().symbols;
    let second = read_image_bytes(FIXTURE).unwrap().symbols;

    let first_paths: Vec<&str> = first.paths().collect();
    let second_paths: Vec<&str> = second.paths().collect();
    assert_eq!(first_paths, second_paths);

    for path in first_paths {
        assert_eq!(first.resolve(path).unwrap(), second.resolve(path).unwrap());
    }
}

#[test]
fn initialised_image_memory_decodes_through_the_symbols() {
    let image = read_image_bytes(FIXTURE).unwrap();

    // Serve the image's own data sections as a simulated target, so the
    // decoded values confirm the compiler's actual layout.
    let file = object::File::parse(FIXTURE).unwrap();
    let memory = MemoryImage::new();
    for name in [".data", ".bss"] {
        let section = file.section_by_name(name).unwrap();
        let mut bytes = section.data().unwrap().to_vec();
        bytes.resize(section.size() as usize, 0);
        memory.add_region(section.address(), bytes);
    }

    let read = |path: &str| {
        let symbol = image.symbols.resolve(path).unwrap();
        variables::read(&memory, ByteOrder::Little, &symbol).unwrap()
    };

    assert_eq!(read("g_ctrl.mode"), Value::UnsignedInt(2));
    assert_eq!(read("g_ctrl.enabled"), Value::UnsignedInt(1));
    assert_eq!(read("g_ctrl.level"), Value::UnsignedInt(5));
    assert_eq!(read("g_ctrl.trim"), Value::SignedInt(-3));
    assert_eq!(read("g_ctrl.inner.gains[1]"), Value::Float(2.0));
    assert_eq!(read("g_bus_voltage"), Value::Float(24.0));
    assert_eq!(read("g_counts[0]"), Value::UnsignedInt(0));
}
