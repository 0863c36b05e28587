use std::fmt::{self, Write};

use symbolic_common::{Arch, DebugId, Language, Name};
use symbolic_debuginfo::{
    DebugSession, FileInfo, Function, FunctionBuilder, ObjectLike, OwnedObject, Symbol,
};

use similar_asserts::assert_eq;

/// Helper to create neat snapshots for function trees.
struct FunctionsDebug<'a>(&'a [Function<'a>], usize);

impl fmt::Display for FunctionsDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for function in self.0 {
            writeln!(
                f,
                "{:indent$}> {:#x}: {} ({:#x})",
                "",
                function.address,
                function.name,
                function.size,
                indent = self.1 * 2
            )?;

            for line in &function.lines {
                writeln!(
                    f,
                    "{:indent$}  {:#x}: {}:{}",
                    "",
                    line.address,
                    line.file.path_str(),
                    line.line,
                    indent = self.1 * 2
                )?;
            }

            write!(f, "{}", FunctionsDebug(&function.inlinees, self.1 + 1))?;
        }

        Ok(())
    }
}

fn build_main() -> Function<'static> {
    let mut builder = FunctionBuilder::new(
        Name::with_language("main", Language::C),
        &b"/build"[..],
        0x1000,
        0x40,
    );
    builder.add_leaf_line(0x1000, Some(0x10), FileInfo::new(&b"main.c"[..], &b"src"[..]), 3);
    builder.add_inlinee(
        0,
        Name::with_language("helper", Language::C),
        0x1010,
        0x20,
        FileInfo::new(&b"main.c"[..], &b"src"[..]),
        4,
    );
    builder.add_leaf_line(0x1010, Some(0x20), FileInfo::new(&b"util.h"[..], &b"include"[..]), 12);
    builder.add_leaf_line(0x1030, Some(0x10), FileInfo::new(&b"main.c"[..], &b"src"[..]), 5);
    builder.finish()
}

#[test]
fn test_function_tree() -> Result<(), Box<dyn std::error::Error>> {
    let mut object = OwnedObject::new(Arch::Amd64, DebugId::nil());
    object.add_function(build_main());

    let session = object.debug_session()?;
    let functions: Vec<_> = session.functions().collect::<Result<_, _>>()?;

    let mut rendered = String::new();
    write!(rendered, "{}", FunctionsDebug(&functions, 0))?;

    insta::assert_snapshot!(rendered, @r###"
    > 0x1000: main (0x40)
      0x1000: src/main.c:3
      0x1010: src/main.c:4
      0x1030: src/main.c:5
      > 0x1010: helper (0x20)
        0x1010: include/util.h:12
    "###);

    Ok(())
}

#[test]
fn test_symbol_map() {
    let mut object = OwnedObject::new(Arch::Arm64, DebugId::nil());
    object
        .add_symbol(Symbol {
            name: Some("_main".into()),
            address: 0x2000,
            size: 0,
        })
        .add_symbol(Symbol {
            name: Some("_start".into()),
            address: 0x1000,
            size: 0,
        });

    let map = object.symbol_map();
    let rendered: Vec<_> = map
        .iter()
        .map(|s| format!("{:#x}+{:#x} {}", s.address, s.size, s.name().unwrap_or("?")))
        .collect();

    assert_eq!(rendered, ["0x1000+0x1000 _start", "0x2000+0x0 _main"]);
    assert_eq!(map.lookup(0x2500).and_then(Symbol::name), Some("_main"));
}
