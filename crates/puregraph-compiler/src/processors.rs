//! Built-in handlers for the bootstrap metamodel.
//!
//! [`register_all`] installs the bind, validate, unbind-walk and unbind
//! handlers for the classifiers of [`puregraph_core::m3`]:
//!
//! | Classifier           | Bind                          | Validate            | UnbindWalk        | Unbind                           |
//! |----------------------|-------------------------------|---------------------|-------------------|----------------------------------|
//! | `PackageableElement` |                               | unique path         | collect + stubs   | detach from package              |
//! | `Class`              | resolve supertypes            | no hierarchy cycles |                   | drop generalizations             |
//! | `PrimitiveType`      | publish top-level name        |                     |                   | retract top-level name           |
//! | `ImportGroup`        | bind imports                  | validate imports    | collect + imports |                                  |
//! | `Import`             | resolve package               | prune if unresolved | collect           | drop resolution                  |
//! | `ImportStub`         | resolve name                  |                     | collect           | drop resolution                  |

use std::collections::HashSet;

use indexmap::IndexSet;

use puregraph_core::m3::{self, property};
use puregraph_core::{CompileState, NodeId, NodeRepository, Value};
use crate::context::ProcessContext;
use crate::error::CompileError;
use crate::matcher::{Matcher, Stage};

/// Registers every built-in handler. Fails if the repository has not been
/// bootstrapped.
pub fn register_all(matcher: &mut Matcher, repo: &NodeRepository) -> Result<(), CompileError> {
    matcher.register(repo, m3::PACKAGEABLE_ELEMENT, Stage::Validate, validate_unique_path)?;
    matcher.register(repo, m3::PACKAGEABLE_ELEMENT, Stage::UnbindWalk, walk_element)?;
    matcher.register(repo, m3::PACKAGEABLE_ELEMENT, Stage::Unbind, detach_element)?;

    matcher.register(repo, m3::CLASS, Stage::Bind, bind_class)?;
    matcher.register(repo, m3::CLASS, Stage::Validate, validate_class)?;
    matcher.register(repo, m3::CLASS, Stage::Unbind, unbind_class)?;

    matcher.register(repo, m3::PRIMITIVE_TYPE, Stage::Bind, bind_primitive)?;
    matcher.register(repo, m3::PRIMITIVE_TYPE, Stage::Unbind, unbind_primitive)?;

    matcher.register(repo, m3::IMPORT_GROUP, Stage::Bind, |ctx, group| {
        for_each_import(ctx, group, Stage::Bind)
    })?;
    matcher.register(repo, m3::IMPORT_GROUP, Stage::Validate, |ctx, group| {
        for_each_import(ctx, group, Stage::Validate)
    })?;
    matcher.register(repo, m3::IMPORT_GROUP, Stage::UnbindWalk, walk_import_group)?;

    matcher.register(repo, m3::IMPORT, Stage::Bind, bind_import)?;
    matcher.register(repo, m3::IMPORT, Stage::Validate, validate_import)?;
    matcher.register(repo, m3::IMPORT, Stage::UnbindWalk, collect)?;
    matcher.register(repo, m3::IMPORT, Stage::Unbind, clear_resolution)?;

    matcher.register(repo, m3::IMPORT_STUB, Stage::Bind, bind_stub)?;
    matcher.register(repo, m3::IMPORT_STUB, Stage::UnbindWalk, collect)?;
    matcher.register(repo, m3::IMPORT_STUB, Stage::Unbind, clear_resolution)?;

    tracing::debug!("built-in processors registered");
    Ok(())
}

fn collect(ctx: &ProcessContext<'_>, node: NodeId) -> Result<(), CompileError> {
    ctx.scope().collect_removed(node);
    Ok(())
}

fn clear_resolution(ctx: &ProcessContext<'_>, node: NodeId) -> Result<(), CompileError> {
    ctx.repository()
        .remove_property(node, property::RESOLVED_NODE)?;
    Ok(())
}

fn top_level(repo: &NodeRepository, name: &str) -> Result<NodeId, CompileError> {
    repo.get_top_level(name)
        .ok_or_else(|| CompileError::runtime(format!("metamodel element '{name}' is missing"), None))
}

fn display_path(repo: &NodeRepository, node: NodeId) -> String {
    repo.element_path(node)
        .unwrap_or_else(|| format!("NodeId({})", node.0))
}

// ---------------------------------------------------------------------------
// PackageableElement
// ---------------------------------------------------------------------------

fn walk_element(ctx: &ProcessContext<'_>, element: NodeId) -> Result<(), CompileError> {
    ctx.scope().collect_removed(element);
    for stub in ctx
        .repository()
        .to_many_nodes(element, property::GENERALIZATION_STUBS)
    {
        ctx.dispatch(stub, Stage::UnbindWalk)?;
    }
    Ok(())
}

/// Removes a node that is going away from its package's children, so path
/// lookups stop finding it.
fn detach_element(ctx: &ProcessContext<'_>, element: NodeId) -> Result<(), CompileError> {
    if !ctx.scope().is_removed(element) {
        return Ok(());
    }
    let repo = ctx.repository();
    if let Some(package) = repo.to_one_node(element, property::PACKAGE) {
        if repo.remove_child(package, element)? {
            ctx.scope().note_detached(package);
        }
    }
    Ok(())
}

/// An element path names at most one live element.
fn validate_unique_path(ctx: &ProcessContext<'_>, element: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    let (Some(package), Some(name)) = (
        repo.to_one_node(element, property::PACKAGE),
        repo.name(element),
    ) else {
        return Ok(());
    };
    let namesakes = repo
        .with_node(package, |p| p.children_named(&name).to_vec())
        .unwrap_or_default();
    let clash = namesakes.into_iter().any(|other| {
        other != element
            && !ctx.scope().is_removed(other)
            && !repo.has_state(other, CompileState::MARKED_FOR_DELETION)
    });
    if clash {
        let package_path = if repo.get_top_level(m3::ROOT) == Some(package) {
            "::".to_string()
        } else {
            display_path(repo, package)
        };
        return Err(ctx.error_at(
            element,
            format!("The element '{name}' already exists in the package '{package_path}'"),
        ));
    }
    Ok(())
}

/// Removes the packages in `candidates` that a batch left empty, walking up
/// through parents that become empty in turn. Only implicit packages go:
/// `Root`, packages with source information and packages still referenced
/// by a surviving node other than through containment are kept. Removal
/// goes through the open transaction, so a rollback restores them.
/// Removes implicit packages left without children, walking up towards Root.
/// Packages still referenced by a live node are kept.
pub fn prune_empty_packages(
    ctx: &ProcessContext<'_>,
    candidates: &[NodeId],
) -> Result<Vec<NodeId>, CompileError> {
    let repo = ctx.repository();
    let root = repo.get_top_level(m3::ROOT);
    let mut stack: Vec<NodeId> = candidates
        .iter()
        .copied()
        .filter(|p| Some(*p) != root)
        .collect();
    if stack.is_empty() {
        return Ok(Vec::new());
    }
    let referenced = referenced_packages(ctx, &stack);
    let mut pruned = Vec::new();

    while let Some(package) = stack.pop() {
        if Some(package) == root
            || !repo.contains(package)
            || repo.has_state(package, CompileState::MARKED_FOR_DELETION)
            || referenced.contains(&package)
            || repo.source_information(package).is_some()
            || !repo.to_many_nodes(package, property::CHILDREN).is_empty()
        {
            continue;
        }
        if let Some(parent) = repo.to_one_node(package, property::PACKAGE) {
            repo.remove_child(parent, package)?;
            stack.push(parent);
        }
        ctx.mutation().mark_for_deletion(repo, package)?;
        pruned.push(package);
    }
    if !pruned.is_empty() {
        tracing::debug!(pruned = pruned.len(), "empty packages removed");
    }
    Ok(pruned)
}

/// Packages on the parent chains of `packages` that a surviving node
/// references through anything but `children` or `package`.
fn referenced_packages(ctx: &ProcessContext<'_>, packages: &[NodeId]) -> HashSet<NodeId> {
    let repo = ctx.repository();
    let mut chain = HashSet::new();
    for package in packages {
        let mut current = Some(*package);
        while let Some(p) = current {
            if !chain.insert(p) {
                break;
            }
            current = repo.to_one_node(p, property::PACKAGE);
        }
    }

    let mut referenced = HashSet::new();
    for id in repo.node_ids() {
        if ctx.scope().is_removed(id) || repo.has_state(id, CompileState::MARKED_FOR_DELETION) {
            continue;
        }
        repo.with_node(id, |n| {
            for (via, target) in n.node_references() {
                if via != property::CHILDREN
                    && via != property::PACKAGE
                    && chain.contains(&target)
                {
                    referenced.insert(target);
                }
            }
        });
    }
    referenced
}

// ---------------------------------------------------------------------------
// Class
// ---------------------------------------------------------------------------

fn bind_class(ctx: &ProcessContext<'_>, class: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    let stubs = repo.to_many_nodes(class, property::GENERALIZATION_STUBS);
    if stubs.is_empty() {
        if repo.to_many_nodes(class, property::GENERALIZATIONS).is_empty() {
            let any = top_level(repo, m3::ANY)?;
            repo.add_value(class, property::GENERALIZATIONS, Value::Node(any))?;
        }
        return Ok(());
    }

    let class_type = top_level(repo, m3::CLASS)?;
    for stub in stubs {
        ctx.full_dispatch(stub, Stage::Bind)?;
        let target = repo
            .to_one_node(stub, property::RESOLVED_NODE)
            .ok_or_else(|| ctx.error_at(stub, "supertype reference was not resolved"))?;
        if repo.classifier(target) != Some(class_type) {
            return Err(ctx.error_at(
                stub,
                format!("{} is not a Class", display_path(repo, target)),
            ));
        }

        let supertype = Value::Node(target);
        if !repo.values(class, property::GENERALIZATIONS).contains(&supertype) {
            repo.add_value(class, property::GENERALIZATIONS, supertype)?;
        }
        let subtype = Value::Node(class);
        if !repo.values(target, property::SPECIALIZATIONS).contains(&subtype) {
            repo.add_value(target, property::SPECIALIZATIONS, subtype)?;
        }
    }
    Ok(())
}

fn validate_class(ctx: &ProcessContext<'_>, class: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    for supertype in repo.to_many_nodes(class, property::GENERALIZATIONS) {
        if repo.specializes(supertype, class) {
            return Err(ctx.error_at(
                class,
                format!(
                    "class hierarchy cycle: {} extends itself",
                    display_path(repo, class)
                ),
            ));
        }
    }
    Ok(())
}

/// Reverses [`bind_class`]: the supertypes forget this class and the stubs
/// drop their resolutions.
fn unbind_class(ctx: &ProcessContext<'_>, class: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    let subtype = Value::Node(class);
    for supertype in repo.to_many_nodes(class, property::GENERALIZATIONS) {
        repo.remove_value(supertype, property::SPECIALIZATIONS, &subtype)?;
    }
    repo.remove_property(class, property::GENERALIZATIONS)?;
    for stub in repo.to_many_nodes(class, property::GENERALIZATION_STUBS) {
        ctx.dispatch(stub, Stage::Unbind)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PrimitiveType
// ---------------------------------------------------------------------------

fn bind_primitive(ctx: &ProcessContext<'_>, primitive: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    let bound = repo.get_or_add_top_level(primitive)?;
    if bound != primitive {
        let name = repo.name(primitive).unwrap_or_default();
        return Err(ctx.error_at(
            primitive,
            format!("duplicate top-level element '{name}'"),
        ));
    }
    Ok(())
}

fn unbind_primitive(ctx: &ProcessContext<'_>, primitive: NodeId) -> Result<(), CompileError> {
    if !ctx.scope().is_removed(primitive) {
        return Ok(());
    }
    let repo = ctx.repository();
    if let Some(name) = repo.name(primitive) {
        if repo.get_top_level(&name) == Some(primitive) {
            repo.remove_top_level(&name)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

fn for_each_import(ctx: &ProcessContext<'_>, group: NodeId, stage: Stage) -> Result<(), CompileError> {
    for import in ctx.repository().to_many_nodes(group, property::IMPORTS) {
        ctx.dispatch(import, stage)?;
    }
    Ok(())
}

fn walk_import_group(ctx: &ProcessContext<'_>, group: NodeId) -> Result<(), CompileError> {
    ctx.scope().collect_removed(group);
    for_each_import(ctx, group, Stage::UnbindWalk)
}

fn bind_import(ctx: &ProcessContext<'_>, import: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    let Some(path) = repo.to_one_string(import, property::PATH) else {
        return Err(ctx.error_at(import, "import has no package path"));
    };
    let package_type = top_level(repo, m3::PACKAGE)?;
    match repo.resolve_path(&path) {
        Some(package) if repo.classifier(package) == Some(package_type) => {
            repo.set_to_one(import, property::RESOLVED_NODE, Value::Node(package))?;
        }
        _ => {
            repo.remove_property(import, property::RESOLVED_NODE)?;
        }
    }
    Ok(())
}

/// An import of a package that does not exist is removed from its group
/// and from the source text.
fn validate_import(ctx: &ProcessContext<'_>, import: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    if repo.to_one_node(import, property::RESOLVED_NODE).is_some() {
        return Ok(());
    }
    let path = repo.to_one_string(import, property::PATH).unwrap_or_default();
    tracing::info!(import = %import, path = %path, "pruning unresolved import");
    if let Some(group) = repo.to_one_node(import, property::IMPORT_GROUP) {
        repo.remove_value(group, property::IMPORTS, &Value::Node(import))?;
    }
    ctx.mutation().delete(repo, import)?;
    Ok(())
}

/// Resolves an import stub. Qualified paths resolve from `Root`; simple
/// names are looked up in every imported package first, then among the
/// top-level elements and the children of `Root`.
fn bind_stub(ctx: &ProcessContext<'_>, stub: NodeId) -> Result<(), CompileError> {
    let repo = ctx.repository();
    let Some(id_or_path) = repo.to_one_string(stub, property::ID_OR_PATH) else {
        return Err(ctx.error_at(stub, "import stub has no target"));
    };

    let resolved = if id_or_path.contains(puregraph_core::repository::PATH_SEPARATOR) {
        repo.resolve_path(&id_or_path)
    } else {
        let mut found = IndexSet::new();
        if let Some(group) = repo.to_one_node(stub, property::IMPORT_GROUP) {
            for import in repo.to_many_nodes(group, property::IMPORTS) {
                let package = repo
                    .to_one_node(import, property::RESOLVED_NODE)
                    .or_else(|| {
                        repo.to_one_string(import, property::PATH)
                            .and_then(|p| repo.resolve_path(&p))
                    });
                if let Some(hit) = package.and_then(|p| repo.find_in_children(p, &id_or_path)) {
                    found.insert(hit);
                }
            }
        }
        match found.len() {
            0 => repo.resolve_path(&id_or_path),
            1 => found.first().copied(),
            _ => {
                let candidates: Vec<String> =
                    found.iter().map(|n| display_path(repo, *n)).collect();
                return Err(ctx.error_at(
                    stub,
                    format!(
                        "{id_or_path} is ambiguous, candidates: {}",
                        candidates.join(", ")
                    ),
                ));
            }
        }
    };

    let target =
        resolved.ok_or_else(|| ctx.error_at(stub, format!("{id_or_path} has not been defined!")))?;
    repo.set_to_one(stub, property::RESOLVED_NODE, Value::Node(target))?;
    Ok(())
}
