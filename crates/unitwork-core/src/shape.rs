//! Entity shape descriptors.
//!
//! Every entity type is described by an [`EntityShape`]: an ordered
//! property-index table plus identifier, version and locking metadata. The
//! unit of work addresses properties by index everywhere; names are only
//! resolved at the API boundary.
//!
//! Shapes are plain `const` data so they can be declared next to the
//! persister that serves them:
//!
//! ```ignore
//! const WIDGET_PROPS: &[PropertyInfo] = &[
//!     PropertyInfo::basic("name", &types::TEXT).nullable(false),
//!     PropertyInfo::basic("version", &types::INTEGER),
//!     PropertyInfo::to_one("owner", "Person").cascade(CascadeStyle::PERSIST),
//! ];
//!
//! const WIDGET: EntityShape = EntityShape::new("Widget", WIDGET_PROPS)
//!     .id("id", &types::INTEGER, IdGeneration::Identity)
//!     .version(1);
//! ```

use crate::association::CascadeStyle;
use crate::error::{Error, Result};
use crate::types::{self, PropertyType};

/// How a property is stored.
#[derive(Debug, Clone, Copy)]
pub enum PropertyKind {
    /// A plain column value.
    Basic,
    /// A foreign key to another entity.
    ToOne {
        target: &'static str,
        cascade: CascadeStyle,
    },
    /// A collection of entities of one type.
    ///
    /// Inverse collections are mapped by a foreign key on the element side and
    /// never produce collection statements of their own.
    Collection {
        element: &'static str,
        cascade: CascadeStyle,
        inverse: bool,
    },
}

/// Metadata about one entity property.
#[derive(Debug, Clone, Copy)]
pub struct PropertyInfo {
    pub name: &'static str,
    pub kind: PropertyKind,
    /// Type used for snapshot comparison. For associations, the type of the
    /// foreign key value.
    pub ty: &'static dyn PropertyType,
    /// Column (or foreign key) accepts NULL.
    pub nullable: bool,
    pub insertable: bool,
    /// Non-updatable properties are never dirty.
    pub updatable: bool,
    /// Fetched on first access instead of with the row. All lazy basic
    /// properties of an entity belong to one fetch group.
    pub lazy: bool,
}

impl PropertyInfo {
    /// A basic column property.
    pub const fn basic(name: &'static str, ty: &'static dyn PropertyType) -> Self {
        Self {
            name,
            kind: PropertyKind::Basic,
            ty,
            nullable: true,
            insertable: true,
            updatable: true,
            lazy: false,
        }
    }

    /// A many-to-one / one-to-one association to `target`.
    pub const fn to_one(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::ToOne {
                target,
                cascade: CascadeStyle::NONE,
            },
            ty: &types::INTEGER,
            nullable: true,
            insertable: true,
            updatable: true,
            lazy: true,
        }
    }

    /// A one-to-many / many-to-many collection of `element` entities.
    pub const fn collection(name: &'static str, element: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::Collection {
                element,
                cascade: CascadeStyle::NONE,
                inverse: false,
            },
            ty: &types::INTEGER,
            nullable: true,
            insertable: true,
            updatable: true,
            lazy: true,
        }
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    pub const fn lazy(mut self, value: bool) -> Self {
        self.lazy = value;
        self
    }

    /// Type of the foreign key value for an association.
    pub const fn key_type(mut self, ty: &'static dyn PropertyType) -> Self {
        self.ty = ty;
        self
    }

    /// Set the cascade style of an association. No effect on basic properties.
    pub const fn cascade(mut self, style: CascadeStyle) -> Self {
        self.kind = match self.kind {
            PropertyKind::Basic => PropertyKind::Basic,
            PropertyKind::ToOne { target, .. } => PropertyKind::ToOne {
                target,
                cascade: style,
            },
            PropertyKind::Collection {
                element, inverse, ..
            } => PropertyKind::Collection {
                element,
                cascade: style,
                inverse,
            },
        };
        self
    }

    /// Mark a collection as mapped by the element side.
    pub const fn inverse(mut self, value: bool) -> Self {
        if let PropertyKind::Collection {
            element, cascade, ..
        } = self.kind
        {
            self.kind = PropertyKind::Collection {
                element,
                cascade,
                inverse: value,
            };
        }
        self
    }

    pub const fn is_basic(&self) -> bool {
        matches!(self.kind, PropertyKind::Basic)
    }

    pub const fn is_to_one(&self) -> bool {
        matches!(self.kind, PropertyKind::ToOne { .. })
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::Collection { .. })
    }

    /// Lazy basic property (part of the entity's lazy fetch group).
    pub const fn is_lazy_basic(&self) -> bool {
        self.lazy && self.is_basic()
    }

    pub const fn cascade_style(&self) -> CascadeStyle {
        match self.kind {
            PropertyKind::Basic => CascadeStyle::NONE,
            PropertyKind::ToOne { cascade, .. } | PropertyKind::Collection { cascade, .. } => {
                cascade
            }
        }
    }

    /// Entity name on the other side of an association.
    pub const fn associated_entity(&self) -> Option<&'static str> {
        match self.kind {
            PropertyKind::Basic => None,
            PropertyKind::ToOne { target, .. } => Some(target),
            PropertyKind::Collection { element, .. } => Some(element),
        }
    }
}

/// Identifier generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGeneration {
    /// Application sets the identifier before `persist`.
    Assigned,
    /// Identifier is fetched from the persister's next-id statement at `persist`.
    Sequence,
    /// Identifier is generated by storage during the insert.
    Identity,
}

/// Which columns guard an update or delete against concurrent modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimisticLockStyle {
    None,
    /// Compare the version property (requires one).
    #[default]
    Version,
    /// Compare the previous values of the changed properties.
    Dirty,
    /// Compare the previous values of every persistent property.
    All,
}

/// Natural identifier declaration.
#[derive(Debug, Clone, Copy)]
pub struct NaturalIdInfo {
    /// Indices of the basic properties forming the natural id.
    pub properties: &'static [usize],
    /// Whether the natural id may change after insert.
    pub mutable: bool,
}

/// Descriptor of one entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityShape {
    pub name: &'static str,
    /// Root of the inheritance hierarchy this shape belongs to. Subtypes share
    /// the root's identifier space.
    pub root: Option<&'static str>,
    pub id_name: &'static str,
    pub id_type: &'static dyn PropertyType,
    pub id_generation: IdGeneration,
    pub properties: &'static [PropertyInfo],
    /// Index of the integer version property.
    pub version: Option<usize>,
    pub optimistic_lock: OptimisticLockStyle,
    pub natural_id: Option<NaturalIdInfo>,
    /// Immutable entities are never dirty-checked or updated.
    pub mutable: bool,
}

impl EntityShape {
    pub const fn new(name: &'static str, properties: &'static [PropertyInfo]) -> Self {
        Self {
            name,
            root: None,
            id_name: "id",
            id_type: &types::INTEGER,
            id_generation: IdGeneration::Assigned,
            properties,
            version: None,
            optimistic_lock: OptimisticLockStyle::Version,
            natural_id: None,
            mutable: true,
        }
    }

    pub const fn id(
        mut self,
        name: &'static str,
        ty: &'static dyn PropertyType,
        generation: IdGeneration,
    ) -> Self {
        self.id_name = name;
        self.id_type = ty;
        self.id_generation = generation;
        self
    }

    /// Declare this shape a subtype within the `root` hierarchy.
    pub const fn extends(mut self, root: &'static str) -> Self {
        self.root = Some(root);
        self
    }

    pub const fn version(mut self, index: usize) -> Self {
        self.version = Some(index);
        self
    }

    pub const fn optimistic_lock(mut self, style: OptimisticLockStyle) -> Self {
        self.optimistic_lock = style;
        self
    }

    pub const fn natural_id(mut self, properties: &'static [usize], mutable: bool) -> Self {
        self.natural_id = Some(NaturalIdInfo {
            properties,
            mutable,
        });
        self
    }

    pub const fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Name used for identity keys.
    pub const fn root_name(&self) -> &'static str {
        match self.root {
            Some(root) => root,
            None => self.name,
        }
    }

    pub fn property(&self, index: usize) -> Option<&PropertyInfo> {
        self.properties.get(index)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Whether updates and deletes compare the version property.
    pub fn is_version_checked(&self) -> bool {
        self.version.is_some() && self.optimistic_lock == OptimisticLockStyle::Version
    }

    pub fn lazy_properties(&self) -> impl Iterator<Item = usize> + '_ {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_lazy_basic())
            .map(|(i, _)| i)
    }

    pub fn associations(&self) -> impl Iterator<Item = (usize, &PropertyInfo)> + '_ {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_basic())
    }

    /// Check internal consistency of the descriptor.
    pub fn validate(&self) -> Result<()> {
        for (i, prop) in self.properties.iter().enumerate() {
            if self.properties[..i].iter().any(|p| p.name == prop.name) {
                return Err(Error::Mapping(format!(
                    "{}: duplicate property '{}'",
                    self.name, prop.name
                )));
            }
            if prop.name == self.id_name {
                return Err(Error::Mapping(format!(
                    "{}: property '{}' shadows the identifier",
                    self.name, prop.name
                )));
            }
        }
        if let Some(version) = self.version {
            match self.properties.get(version) {
                Some(prop) if prop.is_basic() && !prop.lazy => {}
                _ => {
                    return Err(Error::Mapping(format!(
                        "{}: version index {version} is not an eager basic property",
                        self.name
                    )));
                }
            }
        }
        if let Some(natural_id) = &self.natural_id {
            if natural_id.properties.is_empty() {
                return Err(Error::Mapping(format!(
                    "{}: natural id declares no properties",
                    self.name
                )));
            }
            for &index in natural_id.properties {
                match self.properties.get(index) {
                    Some(prop) if prop.is_basic() => {}
                    _ => {
                        return Err(Error::Mapping(format!(
                            "{}: natural id index {index} is not a basic property",
                            self.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
