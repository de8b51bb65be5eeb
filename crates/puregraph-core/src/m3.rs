//! The bootstrap metamodel.
//!
//! [`bootstrap`] installs the classifiers every repository needs before any
//! source can be compiled: the `Any` root type, the classifier hierarchy
//! used by the built-in processors, the primitive types and the `Root`
//! package. Every bootstrapped element is a top-level entry.
//!
//! ```text
//! Any
//! ├── Type
//! │   ├── Class          (also PackageableElement)
//! │   └── PrimitiveType  (also PackageableElement)
//! ├── PackageableElement
//! │   └── Package
//! ├── ImportGroup
//! ├── Import
//! └── ImportStub
//! ```

use crate::error::CoreError;
use crate::id::NodeId;
use crate::node::Value;
use crate::repository::NodeRepository;

pub const ANY: &str = "Any";
pub const TYPE: &str = "Type";
pub const CLASS: &str = "Class";
pub const PRIMITIVE_TYPE: &str = "PrimitiveType";
pub const PACKAGEABLE_ELEMENT: &str = "PackageableElement";
pub const PACKAGE: &str = "Package";
pub const IMPORT_GROUP: &str = "ImportGroup";
pub const IMPORT: &str = "Import";
pub const IMPORT_STUB: &str = "ImportStub";
pub const ROOT: &str = "Root";

/// Primitive types installed as top-level instances of `PrimitiveType`.
pub const PRIMITIVES: [&str; 3] = ["String", "Integer", "Boolean"];

/// Property names used by the metamodel and the built-in processors.
pub mod property {
    pub use crate::node::CHILDREN;

    /// Owning package of a packageable element.
    pub const PACKAGE: &str = "package";
    /// Direct supertypes of a classifier.
    pub const GENERALIZATIONS: &str = "generalizations";
    /// Direct subtypes of a classifier (maintained by binding).
    pub const SPECIALIZATIONS: &str = "specializations";
    /// Unresolved supertype references produced by a parser.
    pub const GENERALIZATION_STUBS: &str = "generalizationStubs";
    /// Import group a parsed element resolves names against.
    pub const IMPORT_GROUP: &str = "importGroup";
    /// Imports of an import group.
    pub const IMPORTS: &str = "imports";
    /// Package path of an import.
    pub const PATH: &str = "path";
    /// Name or path an import stub refers to.
    pub const ID_OR_PATH: &str = "idOrPath";
    /// Node an import stub resolved to.
    pub const RESOLVED_NODE: &str = "resolvedNode";
}

/// Installs the metamodel into an empty repository.
pub fn bootstrap(repo: &NodeRepository) -> Result<(), CoreError> {
    // Class is its own classifier.
    let class = repo.allocate(CLASS.to_string(), None, None, true)?;
    repo.set_classifier(class, class)?;
    repo.add_top_level(CLASS, class)?;

    let any = classifier(repo, class, ANY, &[])?;
    let ty = classifier(repo, class, TYPE, &[any])?;
    let packageable = classifier(repo, class, PACKAGEABLE_ELEMENT, &[any])?;
    for sup in [ty, packageable] {
        repo.add_value(class, property::GENERALIZATIONS, Value::Node(sup))?;
    }
    let primitive = classifier(repo, class, PRIMITIVE_TYPE, &[ty, packageable])?;
    let package = classifier(repo, class, PACKAGE, &[packageable])?;
    classifier(repo, class, IMPORT_GROUP, &[any])?;
    classifier(repo, class, IMPORT, &[any])?;
    classifier(repo, class, IMPORT_STUB, &[any])?;

    for name in PRIMITIVES {
        let id = repo.create_node(name, primitive, None, true)?;
        repo.add_value(id, property::GENERALIZATIONS, Value::Node(any))?;
        repo.add_top_level(name, id)?;
    }

    let root = repo.create_node(ROOT, package, None, true)?;
    repo.add_top_level(ROOT, root)?;

    tracing::debug!(nodes = repo.len(), "metamodel bootstrapped");
    Ok(())
}

fn classifier(
    repo: &NodeRepository,
    class: NodeId,
    name: &str,
    generalizations: &[NodeId],
) -> Result<NodeId, CoreError> {
    let id = repo.create_node(name, class, None, true)?;
    for sup in generalizations {
        repo.add_value(id, property::GENERALIZATIONS, Value::Node(*sup))?;
    }
    repo.add_top_level(name, id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_bootstrapped_element_is_top_level() {
        let repo = NodeRepository::bootstrapped().unwrap();
        for name in [
            ANY,
            TYPE,
            CLASS,
            PRIMITIVE_TYPE,
            PACKAGEABLE_ELEMENT,
            PACKAGE,
            IMPORT_GROUP,
            IMPORT,
            IMPORT_STUB,
            ROOT,
        ] {
            assert!(repo.get_top_level(name).is_some(), "{name} missing");
        }
        for name in PRIMITIVES {
            assert!(repo.get_top_level(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn class_is_its_own_classifier() {
        let repo = NodeRepository::bootstrapped().unwrap();
        let class = repo.get_top_level(CLASS).unwrap();
        assert_eq!(repo.classifier(class), Some(class));
    }

    #[test]
    fn hierarchy_reaches_any() {
        let repo = NodeRepository::bootstrapped().unwrap();
        let any = repo.get_top_level(ANY).unwrap();
        let class = repo.get_top_level(CLASS).unwrap();
        let package = repo.get_top_level(PACKAGE).unwrap();
        let ty = repo.get_top_level(TYPE).unwrap();
        assert!(repo.specializes(class, any));
        assert!(repo.specializes(package, any));
        assert!(!repo.specializes(package, ty));

        let root = repo.get_top_level(ROOT).unwrap();
        assert!(repo.instance_of(root, package));
        assert!(repo.instance_of(class, ty));
    }

    #[test]
    fn bootstrapped_graph_validates() {
        let repo = NodeRepository::bootstrapped().unwrap();
        repo.validate().unwrap();
    }
}
