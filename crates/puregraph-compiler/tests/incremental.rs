//! End-to-end batches through `IncrementalCompiler`.

use puregraph_compiler::{
    CompileError, CompilerOptions, IncrementalCompiler, ParseContext, Parser, Stage,
};
use puregraph_core::m3::{self, property};
use puregraph_core::{CompileState, NodeId};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn compiler() -> IncrementalCompiler {
    init_tracing();
    IncrementalCompiler::bootstrapped(CompilerOptions::default()).unwrap()
}

fn compile_sources(sources: &[(&str, &str)]) -> IncrementalCompiler {
    let mut compiler = compiler();
    for (id, text) in sources {
        compiler.add_or_replace_source(id, text);
    }
    compiler.compile().unwrap();
    compiler
}

fn nodes_from(compiler: &IncrementalCompiler, source: &str) -> Vec<NodeId> {
    let repo = compiler.repository();
    repo.node_ids()
        .into_iter()
        .filter(|id| {
            repo.source_information(*id)
                .is_some_and(|info| info.source_id() == source)
        })
        .collect()
}

fn assert_no_marked_nodes(compiler: &IncrementalCompiler) {
    let repo = compiler.repository();
    for id in repo.node_ids() {
        assert!(
            !repo.has_state(id, CompileState::MARKED_FOR_DELETION),
            "{id} is still marked for deletion"
        );
    }
}

/// Fails validation when a class shares its name with a sibling in its
/// package.
fn register_duplicate_check(compiler: &mut IncrementalCompiler) {
    compiler
        .register_handler(m3::CLASS, Stage::Validate, |ctx, class| {
            let repo = ctx.repository();
            let name = repo.name(class).unwrap_or_default();
            let Some(package) = repo.to_one_node(class, property::PACKAGE) else {
                return Ok(());
            };
            let siblings = repo
                .with_node(package, |p| p.children_named(&name).len())
                .unwrap_or(0);
            if siblings > 1 {
                return Err(CompileError::compilation("dup", None));
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn compile_then_delete_leaves_no_trace() {
    let mut compiler = compile_sources(&[("/a.pure", "Class test::X {}\n")]);
    let x = compiler.repository().resolve_path("test::X").unwrap();
    assert!(compiler.registry().is_declared(x));

    compiler.delete_source("/a.pure").unwrap();
    let report = compiler.compile().unwrap();
    assert_eq!(report.batches[0].removed, vec!["/a.pure".to_string()]);

    let repo = compiler.repository();
    assert_eq!(repo.resolve_path("test::X"), None);
    assert_eq!(repo.resolve_path("test"), None);
    assert!(!repo.contains(x));
    assert!(nodes_from(&compiler, "/a.pure").is_empty());
    assert!(!compiler.registry().contains("/a.pure"));
    assert!(compiler.registry().entry("/a.pure").is_none());
    repo.validate().unwrap();
    assert_no_marked_nodes(&compiler);
}

#[test]
fn duplicate_class_fails_the_batch_and_keeps_the_first() {
    let mut compiler = compiler();
    register_duplicate_check(&mut compiler);

    compiler.add_or_replace_source("/a.pure", "Class test::Foo{}");
    compiler.compile().unwrap();
    let repo = compiler.repository().clone();
    let foo = repo.resolve_path("test::Foo").unwrap();
    let package = repo.resolve_path("test").unwrap();
    assert_eq!(repo.find_in_children(package, "Foo"), Some(foo));

    let before = repo.export();
    let top_before = repo.top_levels();

    compiler.add_or_replace_source("/b.pure", "Class test::Foo{}");
    let err = compiler.compile().unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"compilation error at /b.pure:1cc1-17: dup");
    assert!(err.is_compilation());

    assert_eq!(repo.resolve_path("test::Foo"), Some(foo));
    assert_eq!(repo.export(), before);
    assert_eq!(repo.top_levels(), top_before);
    assert!(nodes_from(&compiler, "/b.pure").is_empty());
    assert!(compiler.changes().new.contains("/b.pure"));

    // The failed batch can be retried once the source is fixed.
    compiler.modify_source("/b.pure", "Class test::Bar{}").unwrap();
    compiler.compile().unwrap();
    assert!(repo.resolve_path("test::Bar").is_some());
    assert_eq!(repo.resolve_path("test::Foo"), Some(foo));
}

#[test]
fn duplicate_element_paths_are_rejected() {
    let mut compiler = compile_sources(&[("/a.pure", "Class test::Foo {}\n")]);
    let repo = compiler.repository().clone();
    let foo = repo.resolve_path("test::Foo").unwrap();
    let package = repo.resolve_path("test").unwrap();
    let before = repo.export();

    compiler.add_or_replace_source("/b.pure", "Class test::Foo {}\n");
    let err = compiler.compile().unwrap_err();
    insta::assert_snapshot!(
        err.to_string(),
        @"compilation error at /b.pure:1cc1-18: The element 'Foo' already exists in the package 'test'"
    );
    assert_eq!(repo.export(), before);
    assert_eq!(
        repo.with_node(package, |p| p.children_named("Foo").len()),
        Some(1)
    );

    // With the first declaration gone the second one compiles.
    compiler.delete_source("/a.pure").unwrap();
    compiler.compile().unwrap();
    let replacement = repo.resolve_path("test::Foo").unwrap();
    assert_ne!(replacement, foo);
    assert_eq!(
        repo.source_information(replacement).unwrap().source_id(),
        "/b.pure"
    );
    assert_eq!(repo.resolve_path("test"), Some(package));
    repo.validate().unwrap();
}

#[test]
fn deleting_a_source_removes_the_packages_it_emptied() {
    let mut compiler = compile_sources(&[
        ("/deep.pure", "Class test::deep::X {}\n"),
        ("/other.pure", "Class other::Y {}\n"),
    ]);
    let repo = compiler.repository().clone();
    let test = repo.resolve_path("test").unwrap();
    let deep = repo.resolve_path("test::deep").unwrap();

    // A failed batch keeps them.
    compiler.delete_source("/deep.pure").unwrap();
    compiler.add_or_replace_source("/bad.pure", "Class bad::B extends Missing {}\n");
    compiler.compile().unwrap_err();
    assert_eq!(repo.resolve_path("test::deep"), Some(deep));

    compiler.modify_source("/bad.pure", "Class bad::B {}\n").unwrap();
    let report = compiler.compile().unwrap();
    assert_eq!(report.batches[0].pruned_packages, 2);
    assert_eq!(repo.resolve_path("test"), None);
    assert_eq!(repo.resolve_path("test::deep"), None);
    assert!(!repo.contains(test));
    assert!(!repo.contains(deep));
    assert!(repo.resolve_path("other::Y").is_some());
    assert!(repo.resolve_path("bad::B").is_some());
    repo.validate().unwrap();
    assert_no_marked_nodes(&compiler);

    // The package is gone, so importing it is an unresolved import.
    compiler.add_or_replace_source("/app.pure", "import test::*;\nClass app::A {}\n");
    compiler.compile().unwrap();
    assert_eq!(
        compiler.registry().get_content("/app.pure").unwrap(),
        "Class app::A {}\n"
    );
    assert_eq!(repo.resolve_path("test"), None);
}

#[test]
fn packages_shared_with_surviving_sources_are_kept() {
    let mut compiler = compile_sources(&[
        ("/a.pure", "Class shared::A {}\n"),
        ("/b.pure", "Class shared::B {}\n"),
    ]);
    let repo = compiler.repository().clone();
    let shared = repo.resolve_path("shared").unwrap();

    compiler.delete_source("/a.pure").unwrap();
    let report = compiler.compile().unwrap();
    assert_eq!(report.batches[0].pruned_packages, 0);
    assert_eq!(repo.resolve_path("shared"), Some(shared));
    assert_eq!(repo.resolve_path("shared::A"), None);
    assert!(repo.resolve_path("shared::B").is_some());
}

#[test]
fn failed_modification_restores_unbound_nodes() {
    let mut compiler = compile_sources(&[
        ("/a.pure", "Class a::A extends b::B {}\n"),
        ("/b.pure", "Class b::B {}\n"),
    ]);
    let repo = compiler.repository().clone();
    let before = repo.export();
    let top_before = repo.top_levels();

    // b now declares something else, so a's supertype disappears.
    compiler
        .modify_source("/b.pure", "Class b::Renamed {}\n")
        .unwrap();
    let err = compiler.compile().unwrap_err();
    insta::assert_snapshot!(
        err.to_string(),
        @"compilation error at /a.pure:1cc20-23: b::B has not been defined!"
    );

    assert_eq!(repo.export(), before);
    assert_eq!(repo.top_levels(), top_before);
    assert!(compiler.changes().modified.contains("/b.pure"));
}

#[test]
fn dependents_are_rebound_to_the_new_supertype() {
    let mut compiler = compile_sources(&[
        ("/a.pure", "Class a::A extends b::B {}\n"),
        ("/b.pure", "Class b::B {}\n"),
    ]);
    let repo = compiler.repository().clone();
    let a = repo.resolve_path("a::A").unwrap();
    let old_b = repo.resolve_path("b::B").unwrap();

    compiler
        .modify_source("/b.pure", "// second revision\nClass b::B {}\n")
        .unwrap();
    let report = compiler.compile().unwrap();
    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.batches[0].rebound_dependents, 1);
    assert_eq!(report.batches[0].compiled, vec!["/b.pure".to_string()]);

    let new_b = repo.resolve_path("b::B").unwrap();
    assert_ne!(old_b, new_b);
    assert!(!repo.contains(old_b));
    assert_eq!(repo.resolve_path("a::A"), Some(a));
    assert_eq!(repo.to_many_nodes(a, property::GENERALIZATIONS), vec![new_b]);
    assert_eq!(repo.to_many_nodes(new_b, property::SPECIALIZATIONS), vec![a]);
    assert_eq!(repo.source_information(new_b).unwrap().start_line(), 2);
    assert!(repo.has_state(a, CompileState::PROCESSED | CompileState::VALIDATED));
    repo.validate().unwrap();
    assert_no_marked_nodes(&compiler);
}

#[test]
fn deleting_a_supertype_source_fails_until_fixed() {
    let mut compiler = compile_sources(&[
        ("/a.pure", "Class a::A extends b::B {}\n"),
        ("/b.pure", "Class b::B {}\n"),
    ]);
    let repo = compiler.repository().clone();
    let b = repo.resolve_path("b::B").unwrap();

    compiler.delete_source("/b.pure").unwrap();
    let err = compiler.compile().unwrap_err();
    assert!(err.to_string().ends_with("b::B has not been defined!"));
    assert_eq!(err.location().unwrap().source_id(), "/a.pure");
    assert_eq!(repo.resolve_path("b::B"), Some(b));

    // Removing the subclass too makes the batch consistent.
    compiler.delete_source("/a.pure").unwrap();
    compiler.compile().unwrap();
    assert_eq!(repo.resolve_path("b::B"), None);
    assert_eq!(repo.resolve_path("a::A"), None);
    assert!(compiler.registry().source_ids().is_empty());
}

#[test]
fn unresolved_imports_are_pruned_from_the_source() {
    let mut compiler = compiler();
    compiler.add_or_replace_source("/a.pure", "import nowhere::*;\nClass a::A {}\n");
    let report = compiler.compile().unwrap();

    assert_eq!(report.batches.len(), 2);
    assert_eq!(report.rewritten_sources(), vec!["/a.pure".to_string()]);
    assert_eq!(
        report.batches[0].mutation.line_ranges.get("/a.pure"),
        Some(&vec![(1, 1)])
    );
    assert_eq!(
        compiler.registry().get_content("/a.pure").unwrap(),
        "Class a::A {}\n"
    );
    assert!(compiler.changes().is_clean());

    let repo = compiler.repository();
    let a = repo.resolve_path("a::A").unwrap();
    assert_eq!(repo.source_information(a).unwrap().start_line(), 1);
    repo.validate().unwrap();
    assert_no_marked_nodes(&compiler);
}

#[test]
fn earlier_mutation_rounds_stay_committed_when_a_later_round_fails() {
    let mut compiler = compiler();
    // Rejects classes declared on the first line of their source.
    compiler
        .register_handler(m3::CLASS, Stage::Validate, |ctx, class| {
            match ctx.repository().source_information(class) {
                Some(info) if info.start_line() == 1 => {
                    Err(CompileError::compilation("declared on the first line", None))
                }
                _ => Ok(()),
            }
        })
        .unwrap();
    compiler.add_or_replace_source("/a.pure", "import nowhere::*;\nClass a::A {}\n");

    // Round one prunes the import and commits, round two sees the class
    // move to line 1 and fails.
    let err = compiler.compile().unwrap_err();
    assert!(err.to_string().ends_with("declared on the first line"));
    assert_eq!(err.location().unwrap().start_line(), 1);

    let repo = compiler.repository();
    let a = repo.resolve_path("a::A").unwrap();
    assert_eq!(repo.source_information(a).unwrap().start_line(), 2);
    assert_eq!(
        compiler.registry().get_content("/a.pure").unwrap(),
        "Class a::A {}\n"
    );
    assert!(compiler.changes().modified.contains("/a.pure"));
    repo.validate().unwrap();
}

#[test]
fn source_mutations_can_be_left_pending() {
    init_tracing();
    let options = CompilerOptions {
        apply_source_mutations: false,
        ..CompilerOptions::default()
    };
    let mut compiler = IncrementalCompiler::bootstrapped(options).unwrap();
    compiler.add_or_replace_source("/a.pure", "import nowhere::*;\nClass a::A {}\n");
    let report = compiler.compile().unwrap();

    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.batches[0].mutation.modified_files, vec!["/a.pure".to_string()]);
    assert!(compiler
        .registry()
        .get_content("/a.pure")
        .unwrap()
        .starts_with("import"));
}

#[test]
fn imports_resolve_simple_names() {
    let compiler = compile_sources(&[
        ("/model.pure", "Class model::Named {}\n"),
        (
            "/app.pure",
            "import model::*;\n\nClass app::Person extends Named\n{\n}\n",
        ),
    ]);
    let repo = compiler.repository();
    let person = repo.resolve_path("app::Person").unwrap();
    let named = repo.resolve_path("model::Named").unwrap();
    assert_eq!(repo.to_many_nodes(person, property::GENERALIZATIONS), vec![named]);
    assert_eq!(
        repo.source_information(person).unwrap().to_string(),
        "/app.pure:3c1-5c1"
    );
}

#[test]
fn unload_defers_rebinding_to_the_next_compile() {
    let mut compiler = compile_sources(&[
        ("/a.pure", "Class a::A extends b::B {}\n"),
        ("/b.pure", "Class b::B {}\n"),
    ]);
    let repo = compiler.repository().clone();
    let a = repo.resolve_path("a::A").unwrap();

    compiler.delete_source("/b.pure").unwrap();
    let report = compiler.unload().unwrap();
    assert_eq!(report.removed, vec!["/b.pure".to_string()]);
    assert!(report.compiled.is_empty());
    assert_eq!(compiler.pending_rebind(), vec![a]);
    assert_eq!(repo.resolve_path("b::B"), None);
    assert_eq!(report.pruned_packages, 1);
    assert_eq!(repo.resolve_path("b"), None);
    assert!(repo.to_many_nodes(a, property::GENERALIZATIONS).is_empty());
    assert!(!repo.has_state(a, CompileState::PROCESSED));
    repo.validate().unwrap();

    // Without b the pending rebind fails, and stays pending.
    let err = compiler.compile().unwrap_err();
    assert!(err.to_string().ends_with("b::B has not been defined!"));
    assert_eq!(compiler.pending_rebind(), vec![a]);

    compiler.add_or_replace_source("/b.pure", "Class b::B {}\n");
    compiler.compile().unwrap();
    let b = repo.resolve_path("b::B").unwrap();
    assert_eq!(repo.to_many_nodes(a, property::GENERALIZATIONS), vec![b]);
    assert!(compiler.pending_rebind().is_empty());
}

#[test]
fn primitives_are_published_as_top_levels() {
    let mut compiler = compile_sources(&[("/types.pure", "Primitive Money;\n")]);
    let repo = compiler.repository().clone();
    let money = repo.get_top_level("Money").unwrap();

    compiler.add_or_replace_source("/more.pure", "Primitive Money;\n");
    let err = compiler.compile().unwrap_err();
    insta::assert_snapshot!(
        err.to_string(),
        @"compilation error at /more.pure:1cc1-16: duplicate top-level element 'Money'"
    );
    assert_eq!(repo.get_top_level("Money"), Some(money));

    compiler.delete_source("/more.pure").unwrap();
    compiler.delete_source("/types.pure").unwrap();
    compiler.compile().unwrap();
    assert_eq!(repo.get_top_level("Money"), None);
    assert!(!repo.contains(money));
}

#[test]
fn check_reports_without_changing_anything() {
    let mut compiler = compiler();
    compiler.add_or_replace_source("/a.pure", "Class a::A {}\n");
    let repo = compiler.repository().clone();
    let before = repo.export();

    let report = compiler.check().unwrap();
    assert_eq!(report.compiled, vec!["/a.pure".to_string()]);
    assert_eq!(report.parsed_nodes, 2);
    assert_eq!(repo.export(), before);
    assert!(repo.current_transaction().is_none());
    assert!(compiler.changes().new.contains("/a.pure"));

    compiler.add_or_replace_source("/b.pure", "Class b::B extends Missing {}\n");
    let err = compiler.check().unwrap_err();
    assert!(err.is_compilation());
    assert_eq!(repo.export(), before);
}

struct RawParser;

impl Parser for RawParser {
    fn name(&self) -> &str {
        "Raw"
    }

    fn parse(&self, ctx: &ParseContext<'_>, _text: &str) -> Result<Vec<NodeId>, CompileError> {
        let any = ctx.classifier(m3::ANY)?;
        let node = ctx
            .repository()
            .create_node("raw", any, Some(ctx.span(1, 1, 1, 1)), true)?;
        Ok(vec![node])
    }
}

#[test]
fn nodes_without_bind_handlers_are_rejected() {
    let mut compiler = compiler();
    compiler.register_parser(RawParser);
    compiler.add_or_replace_source("/raw.pure", "###Raw\nwhatever\n");
    let err = compiler.compile().unwrap_err();
    match err {
        CompileError::NoHandlerMatched {
            stage, classifier, ..
        } => {
            assert_eq!(stage, Stage::Bind);
            assert_eq!(classifier, "Any");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(nodes_from(&compiler, "/raw.pure").is_empty());
}

#[test]
fn parallel_dispatch_matches_sequential() {
    init_tracing();
    let sources: Vec<(String, String)> = (0..12)
        .map(|i| {
            let text = if i == 0 {
                "Class m::Base {}\n".to_string()
            } else {
                format!("import m::*;\nClass m::C{i} extends Base {{}}\n")
            };
            (format!("/src{i}.pure"), text)
        })
        .collect();

    let mut shapes = Vec::new();
    for parallel in [false, true] {
        let options = CompilerOptions::from_json_str(&format!(
            r#"{{"parallel_dispatch": {parallel}}}"#
        ))
        .unwrap();
        let mut compiler = IncrementalCompiler::bootstrapped(options).unwrap();
        for (id, text) in &sources {
            compiler.add_or_replace_source(id, text);
        }
        compiler.compile().unwrap();

        let repo = compiler.repository();
        let base = repo.resolve_path("m::Base").unwrap();
        let mut subtypes: Vec<String> = repo
            .to_many_nodes(base, property::SPECIALIZATIONS)
            .into_iter()
            .filter_map(|n| repo.element_path(n))
            .collect();
        subtypes.sort();
        shapes.push(subtypes);
        repo.validate().unwrap();
    }
    assert_eq!(shapes[0].len(), 11);
    assert_eq!(shapes[0], shapes[1]);
}
