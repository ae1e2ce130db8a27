//! GLSL front end and resource reflection over naga modules.

use wgpu::naga;

use crate::device::ShaderStage;

/// Scalar or vector member of the uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemberKind {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockMember {
    pub name: String,
    pub offset: u32,
    pub kind: MemberKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextureSlot {
    /// Declared name without the `_texture` suffix.
    pub name: String,
    pub binding: u32,
}

/// Resources a fragment stage expects: one std140 block at set 0 and
/// samplers plus 2D textures at set 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Reflection {
    pub block_size: u32,
    pub members: Vec<BlockMember>,
    pub samplers: Vec<u32>,
    pub textures: Vec<TextureSlot>,
}

/// Parses and validates one stage, formatting failures as
/// `ERROR: 0:<line>: <message>` lines.
pub(crate) fn parse(stage: ShaderStage, source: &str) -> Result<naga::Module, String> {
    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };
    let mut frontend = naga::front::glsl::Frontend::default();
    let module = frontend
        .parse(&naga::front::glsl::Options::from(naga_stage), source)
        .map_err(|errors| {
            errors
                .errors
                .iter()
                .map(|error| {
                    let line = error.meta.location(source).line_number;
                    format!("ERROR: 0:{line}: {}", error.kind)
                })
                .collect::<Vec<_>>()
                .join("\n")
        })?;

    let mut validator =
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
    validator.validate(&module).map_err(|error| {
        let line = error
            .spans()
            .next()
            .map_or(0, |(span, _)| span.location(source).line_number);
        format!("ERROR: 0:{line}: {}", error.as_inner())
    })?;
    Ok(module)
}

pub(crate) fn reflect(module: &naga::Module) -> Reflection {
    let mut reflection = Reflection::default();
    for (_, global) in module.global_variables.iter() {
        let Some(binding) = &global.binding else {
            continue;
        };
        match (global.space, binding.group) {
            (naga::AddressSpace::Uniform, 0) => {
                if let naga::TypeInner::Struct { members, span } = &module.types[global.ty].inner {
                    reflection.block_size = *span;
                    reflection.members = members
                        .iter()
                        .filter_map(|member| {
                            let name = member.name.clone()?;
                            let kind = member_kind(&module.types[member.ty].inner)?;
                            Some(BlockMember {
                                name,
                                offset: member.offset,
                                kind,
                            })
                        })
                        .collect();
                }
            }
            (naga::AddressSpace::Handle, 1) => match &module.types[global.ty].inner {
                naga::TypeInner::Sampler { .. } => reflection.samplers.push(binding.binding),
                naga::TypeInner::Image { .. } => {
                    let declared = global.name.as_deref().unwrap_or_default();
                    let name = declared.strip_suffix("_texture").unwrap_or(declared);
                    reflection.textures.push(TextureSlot {
                        name: name.to_owned(),
                        binding: binding.binding,
                    });
                }
                _ => {}
            },
            _ => {}
        }
    }
    reflection.textures.sort_by_key(|slot| slot.binding);
    reflection
}

fn member_kind(inner: &naga::TypeInner) -> Option<MemberKind> {
    match inner {
        naga::TypeInner::Scalar(scalar) => match scalar.kind {
            naga::ScalarKind::Float => Some(MemberKind::Float),
            naga::ScalarKind::Sint | naga::ScalarKind::Uint => Some(MemberKind::Int),
            _ => None,
        },
        naga::TypeInner::Vector { size, scalar } if scalar.kind == naga::ScalarKind::Float => match size {
            naga::VectorSize::Bi => Some(MemberKind::Vec2),
            naga::VectorSize::Tri => Some(MemberKind::Vec3),
            naga::VectorSize::Quad => Some(MemberKind::Vec4),
        },
        _ => None,
    }
}
